use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Section;
use crate::entity::{normalize_name, EntityType};
use crate::Result;

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Set when the extractor already matched the mention to a canonical entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_entity_id: Option<Uuid>,
}

impl ExtractedEntity {
    #[must_use]
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name: name.into(),
            entity_type,
            description: None,
            aliases: Vec::new(),
            quote: None,
            confidence: 1.0,
            linked_entity_id: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    #[must_use]
    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = Some(quote.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub const fn linked_to(mut self, entity_id: Uuid) -> Self {
        self.linked_entity_id = Some(entity_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl ExtractedRelationship {
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship_type: relationship_type.into(),
            context: None,
            confidence: 1.0,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub statement: String,
    #[serde(default = "default_claim_type")]
    pub claim_type: String,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Names of the entities the claim is about, as written in the section.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

fn default_claim_type() -> String {
    "fact".to_string()
}

impl ExtractedClaim {
    #[must_use]
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            claim_type: default_claim_type(),
            quote: None,
            confidence: 1.0,
            entities: Vec::new(),
            attribute: None,
            value: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, claim_type: impl Into<String>) -> Self {
        self.claim_type = claim_type.into();
        self
    }

    #[must_use]
    pub fn about(mut self, entity: impl Into<String>) -> Self {
        self.entities.push(entity.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = Some(quote.into());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTelemetry {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

/// Everything pulled out of one section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(default)]
    pub claims: Vec<ExtractedClaim>,
    #[serde(default)]
    pub telemetry: ExtractionTelemetry,
}

impl Extraction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entity(mut self, entity: ExtractedEntity) -> Self {
        self.entities.push(entity);
        self
    }

    #[must_use]
    pub fn with_relationship(mut self, relationship: ExtractedRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn with_claim(mut self, claim: ExtractedClaim) -> Self {
        self.claims.push(claim);
        self
    }

    pub fn merge(&mut self, other: Self) {
        self.entities.extend(other.entities);
        self.relationships.extend(other.relationships);
        self.claims.extend(other.claims);
        self.telemetry.input_tokens += other.telemetry.input_tokens;
        self.telemetry.output_tokens += other.telemetry.output_tokens;
        self.telemetry.cost_usd += other.telemetry.cost_usd;
        self.telemetry.latency_ms += other.telemetry.latency_ms;
    }
}

/// One row of the `extractions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub document_id: String,
    pub section_id: String,
    pub workflow_id: String,
    pub text_hash: String,
    /// Carried forward from an earlier run because the section text was unchanged.
    #[serde(default)]
    pub reused: bool,
    #[serde(flatten)]
    pub extraction: Extraction,
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, section: &Section) -> Result<Extraction>;
}

pub struct ExtractionPattern {
    pub entity_type: EntityType,
    pub regex: Regex,
    pub confidence: f64,
}

impl ExtractionPattern {
    pub fn new(entity_type: EntityType, pattern: &str, confidence: f64) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            entity_type,
            regex: Regex::new(pattern)?,
            confidence,
        })
    }
}

/// Offline extractor driven by regular expressions.
///
/// Entities come from the configured patterns. Entities found in the same
/// sentence are related with `mentioned_with`, and sentences of the form
/// "X is/was/has/uses ..." become claims about X.
pub struct RuleBasedExtractor {
    patterns: Vec<ExtractionPattern>,
    claim_pattern: Option<Regex>,
    sentence_break: Option<Regex>,
}

impl RuleBasedExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            claim_pattern: None,
            sentence_break: Regex::new(r"[.!?](?:\s+|$)|\n").ok(),
        }
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: ExtractionPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    #[must_use]
    pub fn with_default_patterns() -> Self {
        let mut extractor = Self::new();

        let defaults = [
            (
                EntityType::Person,
                r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
                0.6,
            ),
            (
                EntityType::Organization,
                r"\b[A-Z][A-Za-z&]+(?: [A-Z][A-Za-z&]+)* (?:Inc|Corp|Ltd|LLC|Foundation|University)\b\.?",
                0.7,
            ),
            (
                EntityType::Other,
                r"\b[A-Z][a-z]+(?: [A-Z][a-z]+)*\b",
                0.5,
            ),
        ];

        for (entity_type, pattern, confidence) in defaults {
            match ExtractionPattern::new(entity_type, pattern, confidence) {
                Ok(p) => extractor.patterns.push(p),
                Err(e) => tracing::warn!("Skipping extraction pattern: {}", e),
            }
        }

        extractor.claim_pattern =
            Regex::new(r"^(?P<subject>[A-Z][\w]*(?: [A-Z][\w]*)*) (?:is|was|has|uses) .+$").ok();

        extractor
    }

    fn entities_in(&self, sentence: &str) -> Vec<ExtractedEntity> {
        let mut found: Vec<ExtractedEntity> = Vec::new();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for pattern in &self.patterns {
            for m in pattern.regex.find_iter(sentence) {
                let overlaps = claimed
                    .iter()
                    .any(|&(start, end)| m.start() < end && start < m.end());
                if overlaps {
                    continue;
                }
                let name = m.as_str().trim_end_matches('.').to_string();
                if normalize_name(&name).len() < 2 {
                    continue;
                }
                claimed.push((m.start(), m.end()));
                found.push(
                    ExtractedEntity::new(name, pattern.entity_type)
                        .with_quote(sentence)
                        .with_confidence(pattern.confidence),
                );
            }
        }

        found
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::with_default_patterns()
    }
}

#[async_trait::async_trait]
impl Extractor for RuleBasedExtractor {
    fn name(&self) -> &'static str {
        "rule_based"
    }

    async fn extract(&self, section: &Section) -> Result<Extraction> {
        let started = std::time::Instant::now();
        let mut output = Extraction::new();

        let sentences: Vec<&str> = match &self.sentence_break {
            Some(re) => re.split(&section.text).collect(),
            None => vec![section.text.as_str()],
        };

        for sentence in sentences.into_iter().map(str::trim).filter(|s| !s.is_empty()) {
            let entities = self.entities_in(sentence);

            for pair in entities.windows(2) {
                output.relationships.push(
                    ExtractedRelationship::new(&pair[0].name, &pair[1].name, "mentioned_with")
                        .with_context(sentence)
                        .with_confidence(0.5),
                );
            }

            if let Some(caps) = self.claim_pattern.as_ref().and_then(|re| re.captures(sentence)) {
                let subject = caps["subject"].to_string();
                output.claims.push(
                    ExtractedClaim::new(sentence)
                        .about(subject)
                        .with_quote(sentence)
                        .with_confidence(0.5),
                );
            }

            output.entities.extend(entities);
        }

        output.telemetry.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::split_sections;

    #[tokio::test]
    async fn test_rule_based_extraction() {
        let sections = split_sections(
            "doc",
            "Python is a language created by Guido Van Rossum. Contact guido@python.org for details.",
            2000,
        );
        let extractor = RuleBasedExtractor::with_default_patterns();
        let output = extractor.extract(&sections[0]).await.unwrap();

        let names: Vec<&str> = output.entities.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"Python"));
        assert!(names.contains(&"Guido Van Rossum"));
        assert!(names.contains(&"guido@python.org"));
        assert!(output
            .relationships
            .iter()
            .any(|r| r.source == "Python" && r.target == "Guido Van Rossum"));
        assert_eq!(output.claims.len(), 1);
        assert_eq!(output.claims[0].entities, vec!["Python".to_string()]);
    }

    #[test]
    fn test_record_flattens_extraction() {
        let record = ExtractionRecord {
            document_id: "d".to_string(),
            section_id: "s0000".to_string(),
            workflow_id: "w".to_string(),
            text_hash: "h".to_string(),
            reused: false,
            extraction: Extraction::new().with_entity(ExtractedEntity::new("A", EntityType::Person)),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("entities").is_some());
        assert!(value.get("telemetry").is_some());
        let back: ExtractionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
