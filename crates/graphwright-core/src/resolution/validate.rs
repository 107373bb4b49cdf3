use serde::{Deserialize, Serialize};

use super::oracle::{ResolutionDecision, ResolutionRequest, ResolutionResponse};
use crate::entity::Entity;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssue {
    OracleFailed,
    MissingDecision,
    MalformedDecision,
    LowConfidence,
    UnknownTarget,
    IncompatibleTypes,
}

impl ValidationIssue {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OracleFailed => "oracle_failed",
            Self::MissingDecision => "missing_decision",
            Self::MalformedDecision => "malformed_decision",
            Self::LowConfidence => "low_confidence",
            Self::UnknownTarget => "unknown_target",
            Self::IncompatibleTypes => "incompatible_types",
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cluster's decision was replaced by `CREATE_NEW`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationNote {
    pub cluster_id: usize,
    pub issue: ValidationIssue,
    pub detail: String,
}

/// Checks oracle decisions before anything is committed.
#[derive(Debug, Clone, Copy)]
pub struct DecisionValidator {
    min_confidence: f64,
}

impl DecisionValidator {
    #[must_use]
    pub const fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Accepts the oracle's answer or downgrades it to `CREATE_NEW` with a note.
    ///
    /// `target` is the stored entity named by a `MERGE_WITH_EXISTING` decision,
    /// if it could be found.
    #[must_use]
    pub fn validate(
        &self,
        request: &ResolutionRequest,
        decided: Result<Option<ResolutionResponse>>,
        target: Option<&Entity>,
    ) -> (ResolutionResponse, Option<ValidationNote>) {
        match self.check(request, decided, target) {
            Ok(mut response) => {
                if response.canonical_name.as_deref().is_none_or(|n| n.trim().is_empty()) {
                    response.canonical_name = request.representative().map(|m| m.name.clone());
                }
                (response, None)
            }
            Err((issue, detail)) => {
                let note = ValidationNote {
                    cluster_id: request.cluster_id,
                    issue,
                    detail,
                };
                (fallback(request), Some(note))
            }
        }
    }

    fn check(
        &self,
        request: &ResolutionRequest,
        decided: Result<Option<ResolutionResponse>>,
        target: Option<&Entity>,
    ) -> std::result::Result<ResolutionResponse, (ValidationIssue, String)> {
        let response = match decided {
            Ok(Some(response)) => response,
            Ok(None) => return Err((ValidationIssue::MissingDecision, "oracle returned no decision".into())),
            Err(Error::InvalidDecision(detail)) => return Err((ValidationIssue::MalformedDecision, detail)),
            Err(e) => return Err((ValidationIssue::OracleFailed, e.to_string())),
        };

        if !(0.0..=1.0).contains(&response.confidence) {
            return Err((
                ValidationIssue::MalformedDecision,
                format!("confidence {} outside [0, 1]", response.confidence),
            ));
        }
        if response.confidence < self.min_confidence {
            return Err((
                ValidationIssue::LowConfidence,
                format!("confidence {:.2} below {:.2}", response.confidence, self.min_confidence),
            ));
        }

        match response.decision {
            ResolutionDecision::MergeWithExisting(id) => {
                let Some(entity) = target.filter(|e| e.id == id) else {
                    return Err((ValidationIssue::UnknownTarget, format!("entity {id} does not exist")));
                };
                if let Some(member) = request
                    .members
                    .iter()
                    .find(|m| !m.entity_type.is_compatible_with(&entity.entity_type))
                {
                    return Err((
                        ValidationIssue::IncompatibleTypes,
                        format!(
                            "{} ({}) cannot merge into {} ({})",
                            member.name, member.entity_type, entity.name, entity.entity_type
                        ),
                    ));
                }
            }
            ResolutionDecision::MergeWithinCluster => {
                let wanted = request.dominant_type();
                if let Some(member) = request
                    .members
                    .iter()
                    .find(|m| !m.entity_type.is_compatible_with(&wanted))
                {
                    return Err((
                        ValidationIssue::IncompatibleTypes,
                        format!("{} ({}) does not fit a {} cluster", member.name, member.entity_type, wanted),
                    ));
                }
            }
            ResolutionDecision::CreateNew => {}
        }

        Ok(response)
    }
}

fn fallback(request: &ResolutionRequest) -> ResolutionResponse {
    let representative = request.representative();
    ResolutionResponse {
        decision: ResolutionDecision::CreateNew,
        canonical_name: representative.map(|m| m.name.clone()),
        description: representative.and_then(|m| m.description.clone()),
        confidence: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::resolution::oracle::ClusterMember;
    use uuid::Uuid;

    fn request(types: &[EntityType]) -> ResolutionRequest {
        ResolutionRequest {
            cluster_id: 7,
            members: types
                .iter()
                .enumerate()
                .map(|(i, t)| ClusterMember {
                    name: format!("m{i}"),
                    entity_type: *t,
                    description: None,
                    aliases: Vec::new(),
                    mention_count: 1,
                    embedding: Vec::new(),
                })
                .collect(),
            candidates: Vec::new(),
        }
    }

    fn issue(note: Option<ValidationNote>) -> Option<ValidationIssue> {
        note.map(|n| n.issue)
    }

    #[test]
    fn test_accepts_sound_decision() {
        let validator = DecisionValidator::new(0.6);
        let target = Entity::new("Ada".to_string(), EntityType::Person);
        let decided = ResolutionResponse::new(ResolutionDecision::MergeWithExisting(target.id), 0.9);
        let (response, note) = validator.validate(&request(&[EntityType::Person]), Ok(Some(decided)), Some(&target));
        assert!(note.is_none());
        assert_eq!(response.decision, ResolutionDecision::MergeWithExisting(target.id));
        assert_eq!(response.canonical_name.as_deref(), Some("m0"));
    }

    #[test]
    fn test_rejections_fall_back_to_create_new() {
        let validator = DecisionValidator::new(0.6);
        let person = request(&[EntityType::Person]);
        let place = Entity::new("Paris".to_string(), EntityType::Location);
        let merge = |id, confidence| Ok(Some(ResolutionResponse::new(ResolutionDecision::MergeWithExisting(id), confidence)));

        let (response, note) = validator.validate(&person, merge(place.id, 0.95), Some(&place));
        assert_eq!(response.decision, ResolutionDecision::CreateNew);
        assert_eq!(issue(note), Some(ValidationIssue::IncompatibleTypes));

        let (_, note) = validator.validate(&person, merge(Uuid::now_v7(), 0.95), None);
        assert_eq!(issue(note), Some(ValidationIssue::UnknownTarget));

        let (_, note) = validator.validate(&person, merge(place.id, 0.2), Some(&place));
        assert_eq!(issue(note), Some(ValidationIssue::LowConfidence));

        let (_, note) = validator.validate(&person, Ok(None), None);
        assert_eq!(issue(note), Some(ValidationIssue::MissingDecision));

        let (_, note) = validator.validate(&person, Err(Error::InvalidDecision("garbled".into())), None);
        assert_eq!(issue(note), Some(ValidationIssue::MalformedDecision));

        let down = Err(Error::Capability {
            capability: "oracle",
            message: "timeout".into(),
        });
        let (response, note) = validator.validate(&person, down, None);
        assert_eq!(issue(note.clone()), Some(ValidationIssue::OracleFailed));
        assert_eq!(note.map(|n| n.cluster_id), Some(7));
        assert_eq!(response.canonical_name.as_deref(), Some("m0"));
    }

    #[test]
    fn test_within_cluster_types_must_agree() {
        let validator = DecisionValidator::new(0.6);
        let mixed = request(&[EntityType::Person, EntityType::Location]);
        let decided = ResolutionResponse::new(ResolutionDecision::MergeWithinCluster, 0.9);
        let (_, note) = validator.validate(&mixed, Ok(Some(decided.clone())), None);
        assert_eq!(issue(note), Some(ValidationIssue::IncompatibleTypes));

        let vague = request(&[EntityType::Person, EntityType::Other]);
        let (response, note) = validator.validate(&vague, Ok(Some(decided)), None);
        assert!(note.is_none());
        assert_eq!(response.decision, ResolutionDecision::MergeWithinCluster);
    }
}
