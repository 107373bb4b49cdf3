pub mod claims;
pub mod cluster;
pub mod embed;
pub mod entities;
pub mod oracle;
pub mod similarity;
pub mod validate;
pub mod vector;

pub use claims::{
    ClaimCounts, ClaimLink, ClaimOutcome, ClaimResolver, ConflictDetector, HeuristicConflictDetector,
    CLAIM_LINKS_TABLE,
};
pub use cluster::Dbscan;
pub use embed::{Embedder, HashingEmbedder};
pub use entities::{
    EntityMapping, EntityResolver, MentionResolution, ResolutionCounts, ResolutionOutcome, ResolvedMention,
    ENTITY_MENTIONS_TABLE,
};
pub use oracle::{
    CandidateEntity, ClusterMember, HeuristicOracle, ResolutionDecision, ResolutionOracle, ResolutionRequest,
    ResolutionResponse,
};
pub use similarity::{centroid, cosine_distance, cosine_similarity, name_similarity, normalize_l2};
pub use validate::{DecisionValidator, ValidationIssue, ValidationNote};
pub use vector::{InMemoryVectorIndex, SearchFilter, VectorIndex};
