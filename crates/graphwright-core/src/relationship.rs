use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Folds free-form relationship labels ("Works For", "works-for") into one key.
#[must_use]
pub fn normalize_relationship_type(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: Uuid,
    pub source_entity_id: Uuid,
    pub target_entity_id: Uuid,
    pub relationship_type: String,
    pub context: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl EntityRelationship {
    pub fn new(source_entity_id: Uuid, target_entity_id: Uuid, relationship_type: &str) -> Result<Self> {
        if source_entity_id == target_entity_id {
            return Err(Error::SelfReference);
        }

        Ok(Self {
            id: Uuid::now_v7(),
            source_entity_id,
            target_entity_id,
            relationship_type: normalize_relationship_type(relationship_type),
            context: None,
            confidence: 1.0,
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn key(&self) -> (Uuid, Uuid, String) {
        (
            self.source_entity_id,
            self.target_entity_id,
            self.relationship_type.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_reference_rejected() {
        let id = Uuid::now_v7();
        assert!(matches!(
            EntityRelationship::new(id, id, "knows"),
            Err(Error::SelfReference)
        ));
    }

    #[test]
    fn test_type_normalization() {
        assert_eq!(normalize_relationship_type("Works For"), "works_for");
        assert_eq!(normalize_relationship_type("works-for"), "works_for");
        assert_eq!(normalize_relationship_type("  USES "), "uses");
    }
}
