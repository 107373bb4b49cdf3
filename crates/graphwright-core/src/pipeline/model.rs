use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::PipelineContext;
use super::reference::{Reference, TableRef};
use super::schema::{ConfigSchema, StageConfig, TableSchema};
use super::writer::TableWriter;
use crate::storage::{Storage, WriteStrategy};
use crate::{Error, Result};

/// Free-form counters a stage reports alongside its row counts.
pub type CustomMetrics = BTreeMap<String, Value>;

/// Registration record for one stage. `name` is also the output table.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub schema: TableSchema,
    pub primary_key: Vec<String>,
    pub write_strategy: WriteStrategy,
    pub references: BTreeMap<String, Reference>,
    pub config_schema: Option<ConfigSchema>,
    pub timeout: Option<Duration>,
}

impl ModelSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, schema: TableSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            primary_key: Vec::new(),
            write_strategy: WriteStrategy::Merge,
            references: BTreeMap::new(),
            config_schema: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub const fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_reference(mut self, alias: impl Into<String>, reference: Reference) -> Self {
        self.references.insert(alias.into(), reference);
        self
    }

    #[must_use]
    pub fn with_config_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = Some(schema);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tables this stage reads from.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.references.values().map(|r| r.table.as_str())
    }
}

/// One processing stage of a pipeline.
///
/// Implementations read their declared references from the [`StageInput`] and
/// write their output through the [`TableWriter`]. They must not keep state
/// between invocations.
#[async_trait::async_trait]
pub trait Model: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    async fn run(&self, input: &StageInput, output: &mut TableWriter) -> Result<CustomMetrics>;

    /// Runs once the rows written by `run` are committed. Not called when
    /// `run` or the commit fails.
    async fn after_commit(&self, _input: &StageInput) -> Result<()> {
        Ok(())
    }
}

/// What a stage sees when it runs.
pub struct StageInput {
    stage: String,
    context: Arc<PipelineContext>,
    references: HashMap<String, TableRef>,
    config: StageConfig,
    storage: Storage,
}

impl StageInput {
    pub(crate) fn new(
        stage: String,
        context: Arc<PipelineContext>,
        references: HashMap<String, TableRef>,
        config: StageConfig,
        storage: Storage,
    ) -> Self {
        Self {
            stage,
            context,
            references,
            config,
            storage,
        }
    }

    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    #[must_use]
    pub const fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Handle for a declared reference. Returns a fresh copy the caller may narrow.
    pub fn reference(&self, alias: &str) -> Result<TableRef> {
        self.references
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::UnknownReference {
                stage: self.stage.clone(),
                table: alias.to_string(),
            })
    }

    /// Direct store access for stages that maintain graph tables or prior state.
    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// Outcome of one stage invocation, as checkpointed and reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    #[serde(default)]
    pub rows_deleted: u64,
    #[serde(default)]
    pub custom_metrics: CustomMetrics,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StageResult {
    #[must_use]
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
