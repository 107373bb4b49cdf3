use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Where a claim was asserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEvidence {
    pub document_id: String,
    pub section_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

impl ClaimEvidence {
    /// Evidence from different runs over the same text counts as the same evidence.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        self.document_id == other.document_id
            && self.section_id == other.section_id
            && self.quote == other.quote
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub statement: String,
    pub normalized_statement: String,
    pub claim_type: String,
    pub signature: String,
    pub entity_ids: Vec<Uuid>,
    pub attribute: Option<String>,
    pub value: Option<String>,
    pub confidence: f64,
    pub evidence: Vec<ClaimEvidence>,
    pub conflicts_with: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    /// Builds a claim; `entity_ids` are sorted and deduplicated before signing.
    #[must_use]
    pub fn new(statement: String, claim_type: String, mut entity_ids: Vec<Uuid>) -> Self {
        entity_ids.sort_unstable();
        entity_ids.dedup();
        let normalized_statement = normalize_statement(&statement);
        let signature = claim_signature(&normalized_statement, &entity_ids);
        let now = Utc::now();

        Self {
            id: Uuid::now_v7(),
            statement,
            normalized_statement,
            claim_type,
            signature,
            entity_ids,
            attribute: None,
            value: None,
            confidence: 1.0,
            evidence: Vec::new(),
            conflicts_with: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: Option<String>, value: Option<String>) -> Self {
        self.attribute = attribute;
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Appends evidence not already recorded. Returns whether anything was added.
    pub fn add_evidence(&mut self, evidence: ClaimEvidence) -> bool {
        if self.evidence.iter().any(|e| e.same_source(&evidence)) {
            return false;
        }
        self.evidence.push(evidence);
        true
    }

    #[must_use]
    pub fn shares_entity_with(&self, other: &Self) -> bool {
        self.entity_ids.iter().any(|id| other.entity_ids.contains(id))
    }
}

/// Lowercases, collapses whitespace and drops trailing punctuation.
#[must_use]
pub fn normalize_statement(statement: &str) -> String {
    let collapsed = statement
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim_end()
        .to_string()
}

/// SHA-256 over the normalized statement and the sorted entity ids.
#[must_use]
pub fn claim_signature(normalized_statement: &str, sorted_entity_ids: &[Uuid]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_statement.as_bytes());
    for id in sorted_entity_ids {
        hasher.update(b"\x1f");
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_statement() {
        assert_eq!(
            normalize_statement("  Python   is   FAST.  "),
            "python is fast"
        );
        assert_eq!(normalize_statement("Is it?!"), "is it");
    }

    #[test]
    fn test_signature_ignores_entity_order_and_case() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let first = Claim::new("Python is fast.".to_string(), "fact".to_string(), vec![a, b]);
        let second = Claim::new("python  is fast".to_string(), "fact".to_string(), vec![b, a, b]);
        assert_eq!(first.signature, second.signature);

        let third = Claim::new("python is fast".to_string(), "fact".to_string(), vec![a]);
        assert_ne!(first.signature, third.signature);
    }

    #[test]
    fn test_evidence_deduplicated_across_runs() {
        let mut claim = Claim::new("x".to_string(), "fact".to_string(), vec![]);
        let evidence = ClaimEvidence {
            document_id: "d1".to_string(),
            section_id: "s0000".to_string(),
            workflow_id: "w1".to_string(),
            quote: Some("x".to_string()),
        };
        assert!(claim.add_evidence(evidence.clone()));
        let rerun = ClaimEvidence {
            workflow_id: "w2".to_string(),
            ..evidence
        };
        assert!(!claim.add_evidence(rerun));
        assert_eq!(claim.evidence.len(), 1);
    }
}
