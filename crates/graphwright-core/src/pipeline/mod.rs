pub mod context;
pub mod dag;
pub mod executor;
pub mod incremental;
pub mod model;
pub mod reference;
pub mod registry;
pub mod runner;
pub mod schema;
pub mod step;
pub mod writer;

pub use context::{IncrementalMode, PipelineContext};
pub use dag::ExecutionPlan;
pub use executor::{
    LevelReport, PipelineEvent, PipelineExecutor, PipelineResult, PipelineStatus, StageOutcome, StageReport,
};
pub use incremental::{fingerprint, previous_state, DocumentDecision, IncrementalTracker, SkipReason};
pub use model::{CustomMetrics, Model, ModelSpec, StageInput, StageResult};
pub use reference::{Reference, ReferenceFilter, TableRef};
pub use registry::{ModelRegistry, ModelRegistryBuilder};
pub use runner::PipelineRunner;
pub use schema::{ColumnDef, ColumnType, ConfigSchema, Row, StageConfig, TableSchema};
pub use step::{
    CheckpointStepRunner, CheckpointStore, DirectStepRunner, InMemoryCheckpointStore, StepFuture, StepOutcome,
    StepRunner,
};
pub use writer::TableWriter;
