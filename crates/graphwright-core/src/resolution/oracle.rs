use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::similarity::{centroid, cosine_similarity, name_similarity};
use crate::entity::{Entity, EntityType};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "target_entity_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionDecision {
    /// The cluster names nothing already in the graph.
    CreateNew,
    /// The cluster is another surface form of an existing entity.
    MergeWithExisting(Uuid),
    /// Every member of the cluster is one new entity.
    MergeWithinCluster,
}

impl ResolutionDecision {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateNew => "CREATE_NEW",
            Self::MergeWithExisting(_) => "MERGE_WITH_EXISTING",
            Self::MergeWithinCluster => "MERGE_WITHIN_CLUSTER",
        }
    }
}

impl std::fmt::Display for ResolutionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MergeWithExisting(id) => write!(f, "{}({id})", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// One distinct surface form within a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub entity_type: EntityType,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub mention_count: usize,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub entity: Entity,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub cluster_id: usize,
    pub members: Vec<ClusterMember>,
    pub candidates: Vec<CandidateEntity>,
}

impl ResolutionRequest {
    /// The most mentioned member, preferring shorter names on ties.
    #[must_use]
    pub fn representative(&self) -> Option<&ClusterMember> {
        self.members.iter().min_by(|a, b| {
            b.mention_count
                .cmp(&a.mention_count)
                .then_with(|| a.name.len().cmp(&b.name.len()))
                .then_with(|| a.name.cmp(&b.name))
        })
    }

    /// Type of the representative, skipping `Other` when a member is more specific.
    #[must_use]
    pub fn dominant_type(&self) -> EntityType {
        let specific = self
            .members
            .iter()
            .filter(|m| m.entity_type != EntityType::Other)
            .max_by_key(|m| m.mention_count)
            .map(|m| m.entity_type);
        specific.unwrap_or(EntityType::Other)
    }

    #[must_use]
    pub fn centroid(&self) -> Vec<f32> {
        let vectors: Vec<&[f32]> = self.members.iter().map(|m| m.embedding.as_slice()).collect();
        centroid(&vectors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResponse {
    pub decision: ResolutionDecision,
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub confidence: f64,
}

impl ResolutionResponse {
    #[must_use]
    pub const fn new(decision: ResolutionDecision, confidence: f64) -> Self {
        Self {
            decision,
            canonical_name: None,
            description: None,
            confidence,
        }
    }

    #[must_use]
    pub fn with_canonical_name(mut self, name: impl Into<String>) -> Self {
        self.canonical_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Parses a raw decision payload such as
    /// `{"decision": "MERGE_WITH_EXISTING", "target_entity_id": "...", "confidence": 0.9}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let field = |key: &str| value.get(key).filter(|v| !v.is_null());

        let decision = match field("decision").and_then(Value::as_str) {
            Some("CREATE_NEW") => ResolutionDecision::CreateNew,
            Some("MERGE_WITHIN_CLUSTER") => ResolutionDecision::MergeWithinCluster,
            Some("MERGE_WITH_EXISTING") => {
                let raw = field("target_entity_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidDecision("MERGE_WITH_EXISTING without target_entity_id".into()))?;
                let target = Uuid::parse_str(raw)
                    .map_err(|e| Error::InvalidDecision(format!("bad target_entity_id {raw:?}: {e}")))?;
                ResolutionDecision::MergeWithExisting(target)
            }
            Some(other) => return Err(Error::InvalidDecision(format!("unknown decision {other:?}"))),
            None => return Err(Error::InvalidDecision("missing decision".into())),
        };

        let confidence = field("confidence")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::InvalidDecision("missing confidence".into()))?;

        Ok(Self {
            decision,
            canonical_name: field("canonical_name").and_then(Value::as_str).map(ToString::to_string),
            description: field("description").and_then(Value::as_str).map(ToString::to_string),
            confidence,
        })
    }
}

/// Decides how a cluster of new mentions relates to the existing graph.
///
/// `Ok(None)` means the oracle gave no decision for this cluster.
#[async_trait::async_trait]
pub trait ResolutionOracle: Send + Sync {
    async fn decide(&self, request: &ResolutionRequest) -> Result<Option<ResolutionResponse>>;
}

/// Offline oracle working from name similarity and type agreement.
#[derive(Debug, Clone)]
pub struct HeuristicOracle {
    merge_threshold: f64,
}

impl HeuristicOracle {
    #[must_use]
    pub const fn new(merge_threshold: f64) -> Self {
        Self { merge_threshold }
    }

    fn best_candidate<'a>(&self, request: &'a ResolutionRequest) -> Option<(&'a Entity, f64)> {
        let wanted = request.dominant_type();
        request
            .candidates
            .iter()
            .filter(|c| c.entity.entity_type.is_compatible_with(&wanted))
            .filter_map(|c| {
                let names = std::iter::once(&c.entity.name).chain(&c.entity.aliases);
                let score = request
                    .members
                    .iter()
                    .flat_map(|m| names.clone().map(move |n| name_similarity(&m.name, n)))
                    .fold(0.0_f64, f64::max);
                (score >= self.merge_threshold).then_some((&c.entity, score))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl Default for HeuristicOracle {
    fn default() -> Self {
        Self::new(0.85)
    }
}

#[async_trait::async_trait]
impl ResolutionOracle for HeuristicOracle {
    async fn decide(&self, request: &ResolutionRequest) -> Result<Option<ResolutionResponse>> {
        let Some(representative) = request.representative() else {
            return Ok(None);
        };

        if let Some((entity, score)) = self.best_candidate(request) {
            return Ok(Some(
                ResolutionResponse::new(ResolutionDecision::MergeWithExisting(entity.id), score)
                    .with_canonical_name(entity.name.clone()),
            ));
        }

        if request.members.len() > 1 {
            let center = request.centroid();
            let total: f64 = request
                .members
                .iter()
                .map(|m| f64::from(cosine_similarity(&m.embedding, &center)))
                .sum();
            let count = f64::from(u32::try_from(request.members.len()).unwrap_or(u32::MAX));
            return Ok(Some(
                ResolutionResponse::new(ResolutionDecision::MergeWithinCluster, total / count)
                    .with_canonical_name(representative.name.clone())
                    .with_description(representative.description.clone()),
            ));
        }

        Ok(Some(
            ResolutionResponse::new(ResolutionDecision::CreateNew, 1.0)
                .with_canonical_name(representative.name.clone())
                .with_description(representative.description.clone()),
        ))
    }
}
