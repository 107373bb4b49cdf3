use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Entity not found: {0}")]
    EntityNotFound(Uuid),

    #[error("Claim not found: {0}")]
    ClaimNotFound(Uuid),

    #[error("Invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("Invalid write strategy: {0}")]
    InvalidWriteStrategy(String),

    #[error("Invalid incremental mode: {0}")]
    InvalidIncrementalMode(String),

    #[error("Self-referential relationship not allowed")]
    SelfReference,

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Model already registered: {0}")]
    DuplicateModel(String),

    #[error("Invalid model {model}: {message}")]
    InvalidModel { model: String, message: String },

    #[error("Stage {stage} references unknown table {table}")]
    UnknownReference { stage: String, table: String },

    #[error("Dependency cycle between stages: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Schema violation in table {table}: {message}")]
    SchemaViolation { table: String, message: String },

    #[error("Invalid config for stage {stage}: {message}")]
    InvalidConfig { stage: String, message: String },

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("Invalid resolution decision: {0}")]
    InvalidDecision(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("{capability} unavailable: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(table: &str, message: impl Into<String>) -> Self {
        Self::CorruptRow {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
