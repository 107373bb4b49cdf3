pub mod claim;
pub mod config;
pub mod document;
pub mod entity;
pub mod error;
pub mod extraction;
pub mod pipeline;
pub mod relationship;
pub mod resolution;
pub mod stages;
pub mod storage;

pub use claim::{claim_signature, normalize_statement, Claim, ClaimEvidence};
pub use config::{ClaimConfig, DatabaseConfig, ExecutorConfig, GraphwrightConfig, ResolutionConfig};
pub use document::{split_sections, Document, Section, DOCUMENTS_TABLE};
pub use entity::{normalize_name, DocumentEntity, Entity, EntityType};
pub use error::{Error, Result};
pub use extraction::{
    ExtractedClaim, ExtractedEntity, ExtractedRelationship, Extraction, ExtractionRecord, Extractor,
    RuleBasedExtractor,
};
pub use pipeline::{
    IncrementalMode, ModelRegistry, PipelineContext, PipelineExecutor, PipelineResult, PipelineRunner,
};
pub use relationship::EntityRelationship;
pub use resolution::{ClaimResolver, EntityResolver};
pub use stages::{register_graph_pipeline, GraphComponents, GRAPH_PIPELINE};
pub use storage::Storage;
