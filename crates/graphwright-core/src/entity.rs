use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Event,
    Concept,
    Technology,
    Product,
    Other,
}

impl EntityType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Event => "event",
            Self::Concept => "concept",
            Self::Technology => "technology",
            Self::Product => "product",
            Self::Other => "other",
        }
    }

    /// Parses extractor output, mapping anything unrecognised to `Other`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Other)
    }

    /// `Other` is compatible with everything; otherwise types must agree.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self == other || *self == Self::Other || *other == Self::Other
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" | "people" => Ok(Self::Person),
            "organization" | "organisation" | "org" | "company" => Ok(Self::Organization),
            "location" | "place" => Ok(Self::Location),
            "event" => Ok(Self::Event),
            "concept" => Ok(Self::Concept),
            "technology" | "tech" | "language" | "framework" => Ok(Self::Technology),
            "product" => Ok(Self::Product),
            "other" => Ok(Self::Other),
            _ => Err(crate::Error::InvalidEntityType(s.to_string())),
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self::parse_lenient(&s)
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

/// Lowercases and collapses whitespace so surface forms compare equal.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    #[must_use]
    pub fn new(name: String, entity_type: EntityType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name,
            entity_type,
            description: None,
            aliases: Vec::new(),
            embedding: None,
            confidence: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for alias in aliases {
            self.add_alias(alias.into());
        }
        self
    }

    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Adds an alias unless it matches the name or an existing alias. Returns whether it was added.
    pub fn add_alias(&mut self, alias: String) -> bool {
        let normalized = normalize_name(&alias);
        if normalized.is_empty() || normalized == self.normalized_name() {
            return false;
        }
        if self.aliases.iter().any(|a| normalize_name(a) == normalized) {
            return false;
        }
        self.aliases.push(alias);
        true
    }

    /// True if the normalized form matches the name or any alias.
    #[must_use]
    pub fn answers_to(&self, normalized: &str) -> bool {
        self.normalized_name() == normalized
            || self.aliases.iter().any(|a| normalize_name(a) == normalized)
    }
}

/// Records that a document mentions a canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEntity {
    pub document_id: String,
    pub entity_id: Uuid,
    pub workflow_id: String,
}

impl DocumentEntity {
    #[must_use]
    pub fn new(document_id: String, entity_id: Uuid, workflow_id: String) -> Self {
        Self {
            document_id,
            entity_id,
            workflow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_type_parsing() {
        assert_eq!(EntityType::parse_lenient("Organisation"), EntityType::Organization);
        assert_eq!(EntityType::parse_lenient(" language "), EntityType::Technology);
        assert_eq!(EntityType::parse_lenient("spaceship"), EntityType::Other);
        assert!("spaceship".parse::<EntityType>().is_err());

        let t: EntityType = serde_json::from_str("\"weird\"").unwrap();
        assert_eq!(t, EntityType::Other);
        assert_eq!(serde_json::to_string(&EntityType::Person).unwrap(), "\"person\"");
    }

    #[test]
    fn test_type_compatibility() {
        assert!(EntityType::Person.is_compatible_with(&EntityType::Person));
        assert!(EntityType::Person.is_compatible_with(&EntityType::Other));
        assert!(!EntityType::Person.is_compatible_with(&EntityType::Location));
    }

    #[test]
    fn test_aliases_are_deduplicated() {
        let mut entity = Entity::new("Python".to_string(), EntityType::Technology)
            .with_aliases(["Python language", "python", "PYTHON  language"]);
        assert_eq!(entity.aliases, vec!["Python language".to_string()]);
        assert!(!entity.add_alias("python LANGUAGE".to_string()));
        assert!(entity.answers_to("python language"));
        assert!(entity.answers_to("python"));
    }
}
