use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entities::EntityMapping;
use crate::claim::{normalize_statement, Claim, ClaimEvidence};
use crate::config::ClaimConfig;
use crate::entity::normalize_name;
use crate::extraction::{ExtractedClaim, ExtractionRecord};
use crate::storage::Storage;
use crate::Result;

/// Table linking each section to the claims it supports.
pub const CLAIM_LINKS_TABLE: &str = "claim_links";

/// Decides whether two claims assert incompatible things.
#[async_trait::async_trait]
pub trait ConflictDetector: Send + Sync {
    async fn conflicts(&self, a: &Claim, b: &Claim) -> Result<bool>;
}

const NEGATIONS: &[&str] = &["not", "no", "never", "none", "nobody", "nothing"];

/// Flags claims about a shared entity with the same type when they give
/// different values for one attribute, or differ only by negation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicConflictDetector;

impl HeuristicConflictDetector {
    /// Statement words with negations removed, and whether the count was odd.
    fn polarity(normalized: &str) -> (Vec<String>, bool) {
        let mut words = Vec::new();
        let mut negated = false;
        for word in normalized.split(' ') {
            let word = word.trim_matches(|c: char| c.is_ascii_punctuation() && c != '\'');
            if let Some(stem) = word.strip_suffix("n't") {
                negated = !negated;
                match stem {
                    "can" | "ca" => words.push("can".to_string()),
                    "won" => words.push("will".to_string()),
                    _ => words.push(stem.to_string()),
                }
            } else if NEGATIONS.contains(&word) {
                negated = !negated;
            } else if !word.is_empty() {
                words.push(word.to_string());
            }
        }
        (words, negated)
    }
}

#[async_trait::async_trait]
impl ConflictDetector for HeuristicConflictDetector {
    async fn conflicts(&self, a: &Claim, b: &Claim) -> Result<bool> {
        if a.id == b.id || a.signature == b.signature || !a.shares_entity_with(b) {
            return Ok(false);
        }
        if !a.claim_type.eq_ignore_ascii_case(&b.claim_type) {
            return Ok(false);
        }

        if let (Some(attr_a), Some(attr_b), Some(value_a), Some(value_b)) =
            (&a.attribute, &b.attribute, &a.value, &b.value)
        {
            if normalize_name(attr_a) == normalize_name(attr_b) {
                return Ok(normalize_statement(value_a) != normalize_statement(value_b));
            }
        }

        let (words_a, negated_a) = Self::polarity(&a.normalized_statement);
        let (words_b, negated_b) = Self::polarity(&b.normalized_statement);
        Ok(negated_a != negated_b && words_a == words_b)
    }
}

/// One row of the `claim_links` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimLink {
    pub workflow_id: String,
    pub document_id: String,
    pub section_id: String,
    pub claim_id: Uuid,
    pub signature: String,
    pub statement: String,
    pub entity_ids: Vec<Uuid>,
    pub confidence: f64,
    pub conflicts_with: Option<Uuid>,
    /// Every claim this run found in conflict with this one. `conflicts_with`
    /// keeps only the first.
    #[serde(default)]
    pub conflicting_claims: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCounts {
    pub extracted: usize,
    pub unique: usize,
    pub created: usize,
    pub merged_existing: usize,
    pub evidence_added: usize,
    pub conflicts: usize,
    pub detector_failures: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    pub claims: Vec<Claim>,
    pub links: Vec<ClaimLink>,
    pub counts: ClaimCounts,
}

/// A batch claim and the sections that asserted it.
struct ClaimGroup {
    claim: Claim,
    sources: BTreeSet<(String, String)>,
}

/// Deduplicates a batch of extracted claims against each other and the graph,
/// links them to resolved entities and records conflicts between them.
pub struct ClaimResolver {
    storage: Storage,
    detector: Arc<dyn ConflictDetector>,
    config: ClaimConfig,
}

impl ClaimResolver {
    #[must_use]
    pub fn new(storage: Storage, detector: Arc<dyn ConflictDetector>) -> Self {
        Self {
            storage,
            detector,
            config: ClaimConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ClaimConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn resolve(
        &self,
        workflow_id: &str,
        extractions: &[ExtractionRecord],
        mapping: &EntityMapping,
    ) -> Result<ClaimOutcome> {
        let mut outcome = ClaimOutcome::default();
        let groups = Self::group_claims(workflow_id, extractions, mapping, &mut outcome);
        outcome.counts.unique = groups.len();

        let mut claims = Vec::with_capacity(groups.len());
        let mut sources = Vec::with_capacity(groups.len());
        for group in groups {
            let claim = self.persist(group.claim, &mut outcome).await?;
            claims.push(claim);
            sources.push(group.sources);
        }

        let detected = if self.config.conflict_detection {
            self.detect_conflicts(&claims, &mut outcome).await?
        } else {
            HashMap::new()
        };

        for (claim, sources) in claims.iter_mut().zip(sources) {
            if let Some(stored) = self.storage.find_claim(claim.id).await? {
                claim.conflicts_with = stored.conflicts_with;
            }
            let conflicting: Vec<Uuid> = detected
                .get(&claim.id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for (document_id, section_id) in sources {
                outcome.links.push(ClaimLink {
                    workflow_id: workflow_id.to_string(),
                    document_id,
                    section_id,
                    claim_id: claim.id,
                    signature: claim.signature.clone(),
                    statement: claim.statement.clone(),
                    entity_ids: claim.entity_ids.clone(),
                    confidence: claim.confidence,
                    conflicts_with: claim.conflicts_with,
                    conflicting_claims: conflicting.clone(),
                });
            }
        }

        tracing::info!(
            workflow_id,
            extracted = outcome.counts.extracted,
            unique = outcome.counts.unique,
            created = outcome.counts.created,
            conflicts = outcome.counts.conflicts,
            "Claim resolution complete"
        );

        outcome.claims = claims;
        Ok(outcome)
    }

    fn group_claims(
        workflow_id: &str,
        extractions: &[ExtractionRecord],
        mapping: &EntityMapping,
        outcome: &mut ClaimOutcome,
    ) -> Vec<ClaimGroup> {
        let mut groups: Vec<ClaimGroup> = Vec::new();
        let mut by_signature: HashMap<String, usize> = HashMap::new();

        for record in extractions {
            for extracted in &record.extraction.claims {
                if normalize_statement(&extracted.statement).is_empty() {
                    continue;
                }
                outcome.counts.extracted += 1;

                let entity_ids = link_entities(mapping, record, extracted);
                let mut claim = Claim::new(
                    extracted.statement.trim().to_string(),
                    extracted.claim_type.clone(),
                    entity_ids,
                )
                .with_attribute(extracted.attribute.clone(), extracted.value.clone())
                .with_confidence(extracted.confidence);
                claim.add_evidence(ClaimEvidence {
                    document_id: record.document_id.clone(),
                    section_id: record.section_id.clone(),
                    workflow_id: workflow_id.to_string(),
                    quote: extracted.quote.clone(),
                });

                let source = (record.document_id.clone(), record.section_id.clone());
                match by_signature.get(&claim.signature).copied() {
                    Some(idx) => {
                        let group = &mut groups[idx];
                        group.claim.confidence = group.claim.confidence.max(claim.confidence);
                        for evidence in claim.evidence {
                            group.claim.add_evidence(evidence);
                        }
                        group.sources.insert(source);
                    }
                    None => {
                        by_signature.insert(claim.signature.clone(), groups.len());
                        groups.push(ClaimGroup {
                            claim,
                            sources: BTreeSet::from([source]),
                        });
                    }
                }
            }
        }

        groups
    }

    /// Stores a new claim, or folds it into the stored claim with the same signature.
    async fn persist(&self, claim: Claim, outcome: &mut ClaimOutcome) -> Result<Claim> {
        let Some(mut stored) = self.storage.find_claim_by_signature(&claim.signature).await? else {
            self.storage.insert_claim(&claim).await?;
            outcome.counts.created += 1;
            return Ok(claim);
        };

        outcome.counts.merged_existing += 1;
        let mut changed = false;
        for evidence in claim.evidence {
            if stored.add_evidence(evidence) {
                outcome.counts.evidence_added += 1;
                changed = true;
            }
        }
        if claim.confidence > stored.confidence {
            stored.confidence = claim.confidence;
            changed = true;
        }
        if changed {
            self.storage.update_claim_evidence(&stored).await?;
        }
        Ok(stored)
    }

    /// Compares each batch claim with every stored claim sharing an entity,
    /// which includes the rest of the batch once it has been persisted.
    /// Returns every conflicting pair found, keyed both ways.
    async fn detect_conflicts(
        &self,
        claims: &[Claim],
        outcome: &mut ClaimOutcome,
    ) -> Result<HashMap<Uuid, BTreeSet<Uuid>>> {
        let mut checked: HashSet<(Uuid, Uuid)> = HashSet::new();
        let mut detected: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();

        for claim in claims {
            let mut others: Vec<Claim> = Vec::new();
            let mut seen: HashSet<Uuid> = HashSet::new();
            for entity_id in &claim.entity_ids {
                for other in self.storage.claims_for_entity(*entity_id).await? {
                    if other.id != claim.id && seen.insert(other.id) {
                        others.push(other);
                    }
                }
            }

            for other in others {
                let pair = if claim.id < other.id {
                    (claim.id, other.id)
                } else {
                    (other.id, claim.id)
                };
                if !checked.insert(pair) {
                    continue;
                }

                match self.detector.conflicts(claim, &other).await {
                    Ok(true) => {
                        self.storage.set_conflict_if_unset(claim.id, other.id).await?;
                        self.storage.set_conflict_if_unset(other.id, claim.id).await?;
                        detected.entry(claim.id).or_default().insert(other.id);
                        detected.entry(other.id).or_default().insert(claim.id);
                        outcome.counts.conflicts += 1;
                        tracing::info!(
                            claim_id = %claim.id,
                            conflicts_with = %other.id,
                            "Conflicting claims recorded"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        outcome.counts.detector_failures += 1;
                        tracing::warn!(claim_id = %claim.id, "Conflict detection failed, assuming no conflict: {}", e);
                    }
                }
            }
        }

        Ok(detected)
    }
}

/// Named entities resolved through the mapping; with no names, entities
/// resolved in the same section whose name occurs in the statement.
fn link_entities(mapping: &EntityMapping, record: &ExtractionRecord, extracted: &ExtractedClaim) -> Vec<Uuid> {
    let named: Vec<Uuid> = extracted
        .entities
        .iter()
        .filter_map(|name| mapping.lookup(&record.document_id, &record.section_id, name))
        .collect();
    if !named.is_empty() {
        return named;
    }

    let statement = normalize_name(&extracted.statement);
    mapping
        .section_entities(&record.document_id, &record.section_id)
        .filter(|(name, _)| contains_phrase(&statement, name))
        .map(|(_, id)| id)
        .collect()
}

/// Whole-word containment of an already normalised phrase.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let boundary = |c: Option<char>| c.is_none_or(|c| !c.is_alphanumeric());
    haystack.match_indices(phrase).any(|(start, _)| {
        boundary(haystack[..start].chars().next_back()) && boundary(haystack[start + phrase.len()..].chars().next())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityType};
    use crate::extraction::Extraction;

    fn record(doc: &str, section: &str, claims: Vec<ExtractedClaim>) -> ExtractionRecord {
        let mut extraction = Extraction::new();
        extraction.claims = claims;
        ExtractionRecord {
            document_id: doc.to_string(),
            section_id: section.to_string(),
            workflow_id: "w1".to_string(),
            text_hash: "h".to_string(),
            reused: false,
            extraction,
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ConflictDetector for Broken {
        async fn conflicts(&self, _a: &Claim, _b: &Claim) -> Result<bool> {
            Err(crate::Error::Capability {
                capability: "conflict detector",
                message: "offline".into(),
            })
        }
    }

    async fn setup() -> (Storage, EntityMapping, Uuid) {
        let storage = Storage::open_memory().await.unwrap();
        let acme = Entity::new("Acme".to_string(), EntityType::Organization);
        storage.insert_entity(&acme).await.unwrap();
        let mut mapping = EntityMapping::new();
        mapping.insert("d1", "s0000", "Acme", acme.id);
        mapping.insert("d2", "s0000", "Acme", acme.id);
        (storage, mapping, acme.id)
    }

    #[test]
    fn test_contains_phrase_respects_word_boundaries() {
        assert!(contains_phrase("acme is based in paris", "acme"));
        assert!(contains_phrase("we met acme.", "acme"));
        assert!(!contains_phrase("acmes are big", "acme"));
    }

    #[tokio::test]
    async fn test_duplicate_claims_merge_evidence() {
        let (storage, mapping, acme) = setup().await;
        let batch = vec![
            record("d1", "s0000", vec![ExtractedClaim::new("Acme is profitable.").with_confidence(0.6)]),
            record("d2", "s0000", vec![ExtractedClaim::new("acme  is PROFITABLE").with_confidence(0.9)]),
        ];

        let resolver = ClaimResolver::new(storage.clone(), Arc::new(HeuristicConflictDetector));
        let outcome = resolver.resolve("w1", &batch, &mapping).await.unwrap();
        assert_eq!(outcome.counts.extracted, 2);
        assert_eq!(outcome.counts.unique, 1);
        assert_eq!(outcome.links.len(), 2);

        let claim = storage.get_claim(outcome.claims[0].id).await.unwrap();
        assert_eq!(claim.entity_ids, vec![acme]);
        assert_eq!(claim.evidence.len(), 2);
        assert!((claim.confidence - 0.9).abs() < f64::EPSILON);

        let again = resolver.resolve("w2", &batch, &mapping).await.unwrap();
        assert_eq!(again.counts.created, 0);
        assert_eq!(again.counts.evidence_added, 0);
        assert_eq!(storage.count_claims().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_attribute_values_both_persist() {
        let (storage, mapping, _) = setup().await;
        let batch = vec![
            record(
                "d1",
                "s0000",
                vec![ExtractedClaim::new("Acme is based in Paris").about("Acme").with_attribute("headquarters", "Paris")],
            ),
            record(
                "d2",
                "s0000",
                vec![ExtractedClaim::new("Acme is based in Berlin").about("Acme").with_attribute("headquarters", "Berlin")],
            ),
        ];

        let outcome = ClaimResolver::new(storage.clone(), Arc::new(HeuristicConflictDetector))
            .resolve("w1", &batch, &mapping)
            .await
            .unwrap();
        assert_eq!(outcome.counts.conflicts, 1);

        let paris = storage.get_claim(outcome.claims[0].id).await.unwrap();
        let berlin = storage.get_claim(outcome.claims[1].id).await.unwrap();
        assert_eq!(paris.conflicts_with, Some(berlin.id));
        assert_eq!(berlin.conflicts_with, Some(paris.id));
        assert!(outcome.links.iter().all(|l| l.conflicts_with.is_some()));
    }

    #[tokio::test]
    async fn test_every_conflicting_pair_reaches_the_links() {
        let (storage, mapping, _) = setup().await;
        let headquarters = |city: &str| {
            ExtractedClaim::new(format!("Acme is based in {city}"))
                .about("Acme")
                .with_attribute("headquarters", city)
        };
        let batch = vec![
            record("d1", "s0000", vec![headquarters("Paris"), headquarters("Rome")]),
            record("d2", "s0000", vec![headquarters("Berlin")]),
        ];

        let outcome = ClaimResolver::new(storage.clone(), Arc::new(HeuristicConflictDetector))
            .resolve("w1", &batch, &mapping)
            .await
            .unwrap();
        assert_eq!(outcome.counts.conflicts, 3);

        // A single pointer per claim cannot hold all three pairs.
        for claim in &outcome.claims {
            let stored = storage.get_claim(claim.id).await.unwrap();
            assert!(stored.conflicts_with.is_some());
        }
        for link in &outcome.links {
            let mut expected: Vec<Uuid> = outcome
                .claims
                .iter()
                .map(|c| c.id)
                .filter(|id| *id != link.claim_id)
                .collect();
            expected.sort();
            assert_eq!(link.conflicting_claims, expected, "{}", link.statement);
        }
    }

    #[tokio::test]
    async fn test_negation_conflicts() {
        let detector = HeuristicConflictDetector;
        let id = Uuid::now_v7();
        let yes = Claim::new("Acme is profitable".into(), "fact".into(), vec![id]);
        let no = Claim::new("Acme isn't profitable".into(), "fact".into(), vec![id]);
        let other = Claim::new("Acme is large".into(), "fact".into(), vec![id]);
        let opinion = Claim::new("Acme is not profitable".into(), "opinion".into(), vec![id]);
        assert!(detector.conflicts(&yes, &no).await.unwrap());
        assert!(!detector.conflicts(&yes, &other).await.unwrap());
        assert!(!detector.conflicts(&yes, &opinion).await.unwrap());
    }

    #[tokio::test]
    async fn test_detector_failure_still_persists() {
        let (storage, mapping, _) = setup().await;
        let batch = vec![
            record("d1", "s0000", vec![ExtractedClaim::new("Acme is profitable")]),
            record("d2", "s0000", vec![ExtractedClaim::new("Acme is not profitable")]),
        ];

        let outcome = ClaimResolver::new(storage.clone(), Arc::new(Broken))
            .resolve("w1", &batch, &mapping)
            .await
            .unwrap();
        assert_eq!(outcome.counts.detector_failures, 1);
        assert_eq!(outcome.counts.conflicts, 0);
        assert_eq!(storage.count_claims().await.unwrap(), 2);
    }
}
