use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cluster::Dbscan;
use super::embed::Embedder;
use super::oracle::{
    CandidateEntity, ClusterMember, ResolutionDecision, ResolutionOracle, ResolutionRequest, ResolutionResponse,
};
use super::similarity::normalize_l2;
use super::validate::{DecisionValidator, ValidationNote};
use super::vector::{SearchFilter, VectorIndex};
use crate::config::ResolutionConfig;
use crate::entity::{normalize_name, DocumentEntity, Entity, EntityType};
use crate::extraction::ExtractionRecord;
use crate::relationship::EntityRelationship;
use crate::storage::Storage;
use crate::{Error, Result};

/// Table holding one resolved mention per row.
pub const ENTITY_MENTIONS_TABLE: &str = "entity_mentions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionResolution {
    /// Matched an existing entity without clustering.
    Linked,
    Created,
    MergedExisting,
    MergedCluster,
}

impl MentionResolution {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Linked => "linked",
            Self::Created => "created",
            Self::MergedExisting => "merged_existing",
            Self::MergedCluster => "merged_cluster",
        }
    }
}

impl std::fmt::Display for MentionResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `entity_mentions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMention {
    pub workflow_id: String,
    pub document_id: String,
    pub section_id: String,
    pub mention_key: String,
    pub name: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub resolution: MentionResolution,
}

impl ResolvedMention {
    #[must_use]
    pub fn mention_key(entity_type: EntityType, name: &str) -> String {
        format!("{}:{}", entity_type.as_str(), normalize_name(name))
    }
}

/// Name to canonical entity lookup for one batch, narrowest scope first.
#[derive(Debug, Clone, Default)]
pub struct EntityMapping {
    sections: HashMap<(String, String), BTreeMap<String, Uuid>>,
    documents: HashMap<String, BTreeMap<String, Uuid>>,
    batch: BTreeMap<String, Uuid>,
}

impl EntityMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_mentions(mentions: &[ResolvedMention]) -> Self {
        let mut mapping = Self::new();
        for mention in mentions {
            mapping.insert(&mention.document_id, &mention.section_id, &mention.name, mention.entity_id);
        }
        mapping
    }

    /// The first entity recorded for a name wins at every scope.
    pub fn insert(&mut self, document_id: &str, section_id: &str, name: &str, entity_id: Uuid) {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return;
        }
        self.sections
            .entry((document_id.to_string(), section_id.to_string()))
            .or_default()
            .entry(normalized.clone())
            .or_insert(entity_id);
        self.documents
            .entry(document_id.to_string())
            .or_default()
            .entry(normalized.clone())
            .or_insert(entity_id);
        self.batch.entry(normalized).or_insert(entity_id);
    }

    /// Looks a name up in the section, then the document, then the whole batch.
    #[must_use]
    pub fn lookup(&self, document_id: &str, section_id: &str, name: &str) -> Option<Uuid> {
        let normalized = normalize_name(name);
        self.sections
            .get(&(document_id.to_string(), section_id.to_string()))
            .and_then(|names| names.get(&normalized))
            .or_else(|| self.documents.get(document_id).and_then(|names| names.get(&normalized)))
            .or_else(|| self.batch.get(&normalized))
            .copied()
    }

    /// Normalised names resolved within one section.
    pub fn section_entities(&self, document_id: &str, section_id: &str) -> impl Iterator<Item = (&str, Uuid)> {
        self.sections
            .get(&(document_id.to_string(), section_id.to_string()))
            .into_iter()
            .flat_map(|names| names.iter().map(|(name, id)| (name.as_str(), *id)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionCounts {
    pub mentions: usize,
    pub linked: usize,
    pub clusters: usize,
    pub entities_created: usize,
    pub merged_existing: usize,
    pub merged_within_cluster: usize,
    pub document_links: usize,
    pub relationships_created: usize,
    pub relationships_updated: usize,
    pub relationships_skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    pub mapping: EntityMapping,
    pub mentions: Vec<ResolvedMention>,
    pub counts: ResolutionCounts,
    pub notes: Vec<ValidationNote>,
    pub skipped_relationships: Vec<String>,
}

/// Every mention of one normalised name and type across the batch.
#[derive(Debug, Clone)]
struct MentionGroup {
    name: String,
    normalized: String,
    entity_type: EntityType,
    description: Option<String>,
    aliases: Vec<String>,
    confidence: f64,
    linked_hint: Option<Uuid>,
    occurrences: Vec<(String, String)>,
}

impl MentionGroup {
    fn add_alias(&mut self, alias: &str) {
        let normalized = normalize_name(alias);
        if normalized.is_empty()
            || normalized == self.normalized
            || self.aliases.iter().any(|a| normalize_name(a) == normalized)
        {
            return;
        }
        self.aliases.push(alias.trim().to_string());
    }
}

/// Turns a batch of per-section extractions into canonical entities,
/// document links and relationships.
pub struct EntityResolver {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    oracle: Arc<dyn ResolutionOracle>,
    config: ResolutionConfig,
}

impl EntityResolver {
    #[must_use]
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        oracle: Arc<dyn ResolutionOracle>,
    ) -> Self {
        Self {
            storage,
            embedder,
            index,
            oracle,
            config: ResolutionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ResolutionConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn resolve(&self, workflow_id: &str, extractions: &[ExtractionRecord]) -> Result<ResolutionOutcome> {
        let mut outcome = ResolutionOutcome::default();
        let groups = self.collect_groups(extractions);
        let mut assigned: Vec<Option<(Uuid, MentionResolution)>> = vec![None; groups.len()];

        let mut new_groups = Vec::new();
        for (idx, group) in groups.iter().enumerate() {
            match self.existing_match(group).await? {
                Some(entity) => {
                    for alias in &group.aliases {
                        self.storage.insert_alias(entity.id, alias).await?;
                    }
                    if !entity.answers_to(&group.normalized) {
                        self.storage.insert_alias(entity.id, &group.name).await?;
                    }
                    assigned[idx] = Some((entity.id, MentionResolution::Linked));
                    outcome.counts.linked += 1;
                }
                None => new_groups.push(idx),
            }
        }

        if !new_groups.is_empty() {
            self.resolve_new(&groups, &new_groups, &mut assigned, &mut outcome).await?;
        }

        Self::record_mentions(workflow_id, extractions, &groups, &assigned, &mut outcome);
        self.link_documents(workflow_id, &mut outcome).await?;
        self.commit_relationships(extractions, &mut outcome).await?;

        tracing::info!(
            workflow_id,
            mentions = outcome.counts.mentions,
            linked = outcome.counts.linked,
            clusters = outcome.counts.clusters,
            created = outcome.counts.entities_created,
            merged = outcome.counts.merged_existing + outcome.counts.merged_within_cluster,
            relationships = outcome.counts.relationships_created,
            "Entity resolution complete"
        );

        Ok(outcome)
    }

    fn collect_groups(&self, extractions: &[ExtractionRecord]) -> Vec<MentionGroup> {
        let mut groups: BTreeMap<(String, EntityType), MentionGroup> = BTreeMap::new();

        for record in extractions {
            for mention in &record.extraction.entities {
                let normalized = normalize_name(&mention.name);
                if normalized.is_empty() {
                    continue;
                }

                let key = (normalized.clone(), mention.entity_type);
                let group = groups.entry(key).or_insert_with(|| MentionGroup {
                    name: mention.name.trim().to_string(),
                    normalized,
                    entity_type: mention.entity_type,
                    description: None,
                    aliases: Vec::new(),
                    confidence: 0.0,
                    linked_hint: None,
                    occurrences: Vec::new(),
                });

                if group.description.is_none() {
                    group.description = mention.description.clone().filter(|d| !d.trim().is_empty());
                }
                for alias in &mention.aliases {
                    group.add_alias(alias);
                }
                group.confidence = group.confidence.max(mention.confidence);
                if mention.confidence >= self.config.link_confidence {
                    if let Some(id) = mention.linked_entity_id {
                        group.linked_hint.get_or_insert(id);
                    }
                }
                group
                    .occurrences
                    .push((record.document_id.clone(), record.section_id.clone()));
            }
        }

        groups.into_values().collect()
    }

    /// An extractor-supplied link that checks out, else an exact name or alias match.
    async fn existing_match(&self, group: &MentionGroup) -> Result<Option<Entity>> {
        if let Some(id) = group.linked_hint {
            match self.storage.find_entity(id).await? {
                Some(entity) if entity.entity_type.is_compatible_with(&group.entity_type) => {
                    return Ok(Some(entity));
                }
                _ => tracing::debug!(entity_id = %id, name = %group.name, "Ignoring unusable entity link"),
            }
        }

        Ok(self
            .storage
            .find_entities_by_name(&group.name)
            .await?
            .into_iter()
            .find(|e| e.entity_type.is_compatible_with(&group.entity_type)))
    }

    async fn resolve_new(
        &self,
        groups: &[MentionGroup],
        new_groups: &[usize],
        assigned: &mut [Option<(Uuid, MentionResolution)>],
        outcome: &mut ResolutionOutcome,
    ) -> Result<()> {
        let texts: Vec<String> = new_groups.iter().map(|&idx| groups[idx].name.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(Error::Capability {
                capability: "embedder",
                message: format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
            });
        }

        let clusters = Dbscan::new(self.config.cluster_eps, self.config.cluster_min_samples).clusters(&vectors);
        outcome.counts.clusters = clusters.len();
        tracing::debug!("Clustered {} new names into {} clusters", texts.len(), clusters.len());

        let mut requests = Vec::with_capacity(clusters.len());
        for (cluster_id, positions) in clusters.iter().enumerate() {
            let members: Vec<ClusterMember> = positions
                .iter()
                .map(|&p| {
                    let group = &groups[new_groups[p]];
                    ClusterMember {
                        name: group.name.clone(),
                        entity_type: group.entity_type,
                        description: group.description.clone(),
                        aliases: group.aliases.clone(),
                        mention_count: group.occurrences.len(),
                        embedding: vectors[p].clone(),
                    }
                })
                .collect();
            let mut request = ResolutionRequest {
                cluster_id,
                members,
                candidates: Vec::new(),
            };
            request.candidates = self.candidates(&request).await?;
            requests.push(request);
        }

        let oracle = &self.oracle;
        let decisions: Vec<(ResolutionRequest, Result<Option<ResolutionResponse>>)> = stream::iter(requests)
            .map(|request| async move {
                let decided = oracle.decide(&request).await;
                (request, decided)
            })
            .buffered(self.config.oracle_concurrency.max(1))
            .collect()
            .await;

        let validator = DecisionValidator::new(self.config.min_decision_confidence);
        let mut touched: HashMap<Uuid, Entity> = HashMap::new();

        for ((request, decided), positions) in decisions.into_iter().zip(&clusters) {
            let target = match &decided {
                Ok(Some(ResolutionResponse {
                    decision: ResolutionDecision::MergeWithExisting(id),
                    ..
                })) => match touched.get(id) {
                    Some(entity) => Some(entity.clone()),
                    None => match request.candidates.iter().find(|c| c.entity.id == *id) {
                        Some(candidate) => Some(candidate.entity.clone()),
                        None => self.storage.find_entity(*id).await?,
                    },
                },
                _ => None,
            };

            let (response, note) = validator.validate(&request, decided, target.as_ref());
            if let Some(note) = note {
                tracing::warn!(
                    cluster_id = note.cluster_id,
                    issue = %note.issue,
                    "Resolution decision rejected, creating new entity: {}",
                    note.detail
                );
                outcome.notes.push(note);
            }

            let members: Vec<&MentionGroup> = positions.iter().map(|&p| &groups[new_groups[p]]).collect();

            match (response.decision, target) {
                (ResolutionDecision::MergeWithExisting(_), Some(entity)) => {
                    let mut entity = touched.remove(&entity.id).unwrap_or(entity);
                    for group in &members {
                        entity.add_alias(group.name.clone());
                        for alias in &group.aliases {
                            entity.add_alias(alias.clone());
                        }
                        if entity.description.is_none() {
                            entity.description.clone_from(&group.description);
                        }
                        entity.confidence = entity.confidence.max(group.confidence);
                    }
                    self.storage.update_entity(&entity).await?;
                    for &p in positions {
                        assigned[new_groups[p]] = Some((entity.id, MentionResolution::MergedExisting));
                    }
                    outcome.counts.merged_existing += 1;
                    touched.insert(entity.id, entity);
                }
                (ResolutionDecision::MergeWithinCluster, _) => {
                    let name = response
                        .canonical_name
                        .clone()
                        .or_else(|| request.representative().map(|m| m.name.clone()))
                        .unwrap_or_default();
                    let description = response
                        .description
                        .clone()
                        .or_else(|| members.iter().find_map(|g| g.description.clone()));
                    let confidence = members.iter().map(|g| g.confidence).fold(0.0, f64::max);

                    let mut entity = Entity::new(name, request.dominant_type())
                        .with_description(description)
                        .with_confidence(confidence)
                        .with_embedding(normalize_l2(&request.centroid()));
                    for group in &members {
                        entity.add_alias(group.name.clone());
                        for alias in &group.aliases {
                            entity.add_alias(alias.clone());
                        }
                    }
                    self.create_entity(&entity).await?;
                    for &p in positions {
                        assigned[new_groups[p]] = Some((entity.id, MentionResolution::MergedCluster));
                    }
                    outcome.counts.merged_within_cluster += 1;
                    outcome.counts.entities_created += 1;
                }
                _ => {
                    let single = positions.len() == 1;
                    for &p in positions {
                        let group = &groups[new_groups[p]];
                        let name = response
                            .canonical_name
                            .clone()
                            .filter(|n| single && !n.trim().is_empty())
                            .unwrap_or_else(|| group.name.clone());
                        let description = group
                            .description
                            .clone()
                            .or_else(|| response.description.clone().filter(|_| single));

                        let mut entity = Entity::new(name, group.entity_type)
                            .with_description(description)
                            .with_aliases(group.aliases.clone())
                            .with_confidence(group.confidence)
                            .with_embedding(vectors[p].clone());
                        entity.add_alias(group.name.clone());
                        self.create_entity(&entity).await?;
                        assigned[new_groups[p]] = Some((entity.id, MentionResolution::Created));
                        outcome.counts.entities_created += 1;
                    }
                }
            }
        }

        Ok(())
    }

    async fn candidates(&self, request: &ResolutionRequest) -> Result<Vec<CandidateEntity>> {
        if self.config.candidate_k == 0 {
            return Ok(Vec::new());
        }
        let filter = SearchFilter::compatible_with(request.dominant_type());
        let hits = self
            .index
            .search_similar(&request.centroid(), self.config.candidate_k, &filter)
            .await?;

        let mut candidates = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            match self.storage.find_entity(id).await? {
                Some(entity) => candidates.push(CandidateEntity { entity, score }),
                None => tracing::debug!(entity_id = %id, "Vector index returned an unknown entity"),
            }
        }
        Ok(candidates)
    }

    async fn create_entity(&self, entity: &Entity) -> Result<()> {
        self.storage.insert_entity(entity).await?;
        if let Some(embedding) = &entity.embedding {
            self.index
                .upsert(entity.id, entity.entity_type, embedding.clone())
                .await?;
        }
        Ok(())
    }

    fn record_mentions(
        workflow_id: &str,
        extractions: &[ExtractionRecord],
        groups: &[MentionGroup],
        assigned: &[Option<(Uuid, MentionResolution)>],
        outcome: &mut ResolutionOutcome,
    ) {
        let by_key: HashMap<(&str, EntityType), usize> = groups
            .iter()
            .enumerate()
            .map(|(idx, g)| ((g.normalized.as_str(), g.entity_type), idx))
            .collect();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();

        for record in extractions {
            for mention in &record.extraction.entities {
                let normalized = normalize_name(&mention.name);
                let Some(&idx) = by_key.get(&(normalized.as_str(), mention.entity_type)) else {
                    continue;
                };
                let Some((entity_id, resolution)) = assigned[idx] else {
                    continue;
                };

                outcome
                    .mapping
                    .insert(&record.document_id, &record.section_id, &mention.name, entity_id);
                for alias in &mention.aliases {
                    outcome
                        .mapping
                        .insert(&record.document_id, &record.section_id, alias, entity_id);
                }

                let mention_key = ResolvedMention::mention_key(mention.entity_type, &mention.name);
                let fresh = seen.insert((
                    record.document_id.clone(),
                    record.section_id.clone(),
                    mention_key.clone(),
                ));
                if fresh {
                    outcome.mentions.push(ResolvedMention {
                        workflow_id: workflow_id.to_string(),
                        document_id: record.document_id.clone(),
                        section_id: record.section_id.clone(),
                        mention_key,
                        name: mention.name.trim().to_string(),
                        entity_type: mention.entity_type,
                        entity_id,
                        resolution,
                    });
                }
            }
        }

        outcome.counts.mentions = outcome.mentions.len();
    }

    async fn link_documents(&self, workflow_id: &str, outcome: &mut ResolutionOutcome) -> Result<()> {
        let pairs: HashSet<(&str, Uuid)> = outcome
            .mentions
            .iter()
            .map(|m| (m.document_id.as_str(), m.entity_id))
            .collect();

        let mut created = 0;
        for (document_id, entity_id) in pairs {
            let link = DocumentEntity::new(document_id.to_string(), entity_id, workflow_id.to_string());
            if self.storage.link_document_entity(&link).await? {
                created += 1;
            }
        }
        outcome.counts.document_links = created;
        Ok(())
    }

    /// Runs after every mention has an entity, so either endpoint may be new.
    async fn commit_relationships(&self, extractions: &[ExtractionRecord], outcome: &mut ResolutionOutcome) -> Result<()> {
        let mut stored_names: HashMap<String, Option<Uuid>> = HashMap::new();
        let mut relationships: BTreeMap<(Uuid, Uuid, String), EntityRelationship> = BTreeMap::new();

        for record in extractions {
            for extracted in &record.extraction.relationships {
                let source = self
                    .resolve_name(&outcome.mapping, &mut stored_names, record, &extracted.source)
                    .await?;
                let target = self
                    .resolve_name(&outcome.mapping, &mut stored_names, record, &extracted.target)
                    .await?;

                let (Some(source), Some(target)) = (source, target) else {
                    outcome.counts.relationships_skipped += 1;
                    outcome.skipped_relationships.push(format!(
                        "{} -[{}]-> {}: unresolved endpoint",
                        extracted.source, extracted.relationship_type, extracted.target
                    ));
                    continue;
                };

                let relationship = match EntityRelationship::new(source, target, &extracted.relationship_type) {
                    Ok(rel) => rel
                        .with_context(extracted.context.clone())
                        .with_confidence(extracted.confidence),
                    Err(e) => {
                        outcome.counts.relationships_skipped += 1;
                        outcome.skipped_relationships.push(format!(
                            "{} -[{}]-> {}: {e}",
                            extracted.source, extracted.relationship_type, extracted.target
                        ));
                        continue;
                    }
                };

                relationships
                    .entry(relationship.key())
                    .and_modify(|existing| {
                        if relationship.confidence > existing.confidence {
                            existing.confidence = relationship.confidence;
                        }
                        if existing.context.is_none() {
                            existing.context.clone_from(&relationship.context);
                        }
                    })
                    .or_insert(relationship);
            }
        }

        for relationship in relationships.values() {
            if self.storage.upsert_relationship(relationship).await? {
                outcome.counts.relationships_created += 1;
            } else {
                outcome.counts.relationships_updated += 1;
            }
        }

        if !outcome.skipped_relationships.is_empty() {
            tracing::debug!("Skipped {} relationships", outcome.skipped_relationships.len());
        }
        Ok(())
    }

    async fn resolve_name(
        &self,
        mapping: &EntityMapping,
        stored_names: &mut HashMap<String, Option<Uuid>>,
        record: &ExtractionRecord,
        name: &str,
    ) -> Result<Option<Uuid>> {
        if let Some(id) = mapping.lookup(&record.document_id, &record.section_id, name) {
            return Ok(Some(id));
        }

        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return Ok(None);
        }
        if let Some(cached) = stored_names.get(&normalized) {
            return Ok(*cached);
        }
        let found = self
            .storage
            .find_entities_by_name(name)
            .await?
            .first()
            .map(|e| e.id);
        stored_names.insert(normalized, found);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedEntity, ExtractedRelationship, Extraction};
    use crate::resolution::embed::HashingEmbedder;
    use crate::resolution::oracle::HeuristicOracle;
    use crate::resolution::vector::InMemoryVectorIndex;

    fn record(doc: &str, section: &str, extraction: Extraction) -> ExtractionRecord {
        ExtractionRecord {
            document_id: doc.to_string(),
            section_id: section.to_string(),
            workflow_id: "w1".to_string(),
            text_hash: "h".to_string(),
            reused: false,
            extraction,
        }
    }

    fn resolver(storage: &Storage, oracle: Arc<dyn ResolutionOracle>) -> EntityResolver {
        EntityResolver::new(
            storage.clone(),
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorIndex::new()),
            oracle,
        )
    }

    struct Silent;

    #[async_trait::async_trait]
    impl ResolutionOracle for Silent {
        async fn decide(&self, _request: &ResolutionRequest) -> Result<Option<ResolutionResponse>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_same_name_across_documents_shares_entity() {
        let storage = Storage::open_memory().await.unwrap();
        let batch = vec![
            record(
                "d1",
                "s0000",
                Extraction::new().with_entity(ExtractedEntity::new("Ada Lovelace", EntityType::Person)),
            ),
            record(
                "d2",
                "s0000",
                Extraction::new().with_entity(ExtractedEntity::new("ada  lovelace", EntityType::Person)),
            ),
        ];

        let outcome = resolver(&storage, Arc::new(HeuristicOracle::default()))
            .resolve("w1", &batch)
            .await
            .unwrap();

        assert_eq!(outcome.mentions.len(), 2);
        assert_eq!(outcome.mentions[0].entity_id, outcome.mentions[1].entity_id);
        assert_eq!(storage.count_entities().await.unwrap(), 1);
        assert_eq!(outcome.counts.document_links, 2);
    }

    #[tokio::test]
    async fn test_missing_decision_creates_new_with_note() {
        let storage = Storage::open_memory().await.unwrap();
        let batch = vec![record(
            "d1",
            "s0000",
            Extraction::new().with_entity(ExtractedEntity::new("Grace Hopper", EntityType::Person)),
        )];

        let outcome = resolver(&storage, Arc::new(Silent)).resolve("w1", &batch).await.unwrap();
        assert_eq!(outcome.counts.entities_created, 1);
        assert_eq!(outcome.notes.len(), 1);
        assert_eq!(outcome.mentions[0].resolution, MentionResolution::Created);
    }

    #[tokio::test]
    async fn test_existing_entities_are_linked_not_recreated() {
        let storage = Storage::open_memory().await.unwrap();
        let existing = Entity::new("Acme Corp".to_string(), EntityType::Organization);
        storage.insert_entity(&existing).await.unwrap();

        let batch = vec![record(
            "d1",
            "s0000",
            Extraction::new()
                .with_entity(ExtractedEntity::new("ACME corp", EntityType::Organization))
                .with_entity(ExtractedEntity::new("Grace Hopper", EntityType::Person))
                .with_relationship(ExtractedRelationship::new("Grace Hopper", "Acme Corp", "works for"))
                .with_relationship(ExtractedRelationship::new("Grace Hopper", "Nobody", "knows"))
                .with_relationship(ExtractedRelationship::new("Acme Corp", "acme corp", "owns")),
        )];

        let outcome = resolver(&storage, Arc::new(HeuristicOracle::default()))
            .resolve("w1", &batch)
            .await
            .unwrap();

        assert_eq!(outcome.counts.linked, 1);
        assert_eq!(outcome.counts.entities_created, 1);
        assert_eq!(
            outcome.mapping.lookup("d1", "s0000", "acme corp"),
            Some(existing.id)
        );
        assert_eq!(outcome.counts.relationships_created, 1);
        assert_eq!(outcome.counts.relationships_skipped, 2);

        let rels = storage.get_entity_relationships(existing.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].relationship_type, "works_for");
    }

    #[test]
    fn test_mapping_prefers_narrow_scope() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let mut mapping = EntityMapping::new();
        mapping.insert("d1", "s1", "Mercury", a);
        mapping.insert("d2", "s1", "Mercury", b);

        assert_eq!(mapping.lookup("d2", "s1", "mercury"), Some(b));
        assert_eq!(mapping.lookup("d2", "s9", "mercury"), Some(b));
        assert_eq!(mapping.lookup("d3", "s1", "mercury"), Some(a));
        assert_eq!(mapping.lookup("d1", "s1", "venus"), None);
        assert_eq!(mapping.section_entities("d1", "s1").count(), 1);
    }
}
