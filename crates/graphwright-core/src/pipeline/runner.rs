use std::collections::BTreeMap;

use super::context::{IncrementalMode, PipelineContext};
use super::executor::{PipelineExecutor, PipelineResult};
use crate::{Error, Result};

/// Named pipelines over one executor. A pipeline is a list of target stages;
/// running it pulls in everything upstream of them.
pub struct PipelineRunner {
    executor: PipelineExecutor,
    pipelines: BTreeMap<String, Vec<String>>,
}

impl PipelineRunner {
    #[must_use]
    pub const fn new(executor: PipelineExecutor) -> Self {
        Self {
            executor,
            pipelines: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_pipeline<I, S>(mut self, name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipelines
            .insert(name.into(), targets.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub const fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    /// Runs a pipeline under a fresh workflow id.
    pub async fn run_pipeline(
        &self,
        name: &str,
        document_scope: Option<Vec<String>>,
        mode: IncrementalMode,
    ) -> Result<PipelineResult> {
        let ctx = PipelineContext::generate()
            .with_document_scope(document_scope)
            .with_mode(mode);
        self.run_with_context(name, ctx).await
    }

    /// Re-runs a pipeline under an existing workflow id so completed steps are
    /// resumed rather than repeated.
    pub async fn resume(
        &self,
        name: &str,
        workflow_id: &str,
        document_scope: Option<Vec<String>>,
        mode: IncrementalMode,
    ) -> Result<PipelineResult> {
        let ctx = PipelineContext::new(workflow_id)
            .with_document_scope(document_scope)
            .with_mode(mode);
        self.run_with_context(name, ctx).await
    }

    pub async fn run_with_context(&self, name: &str, ctx: PipelineContext) -> Result<PipelineResult> {
        let targets = self
            .pipelines
            .get(name)
            .ok_or_else(|| Error::UnknownPipeline(name.to_string()))?;
        tracing::info!(pipeline = name, workflow_id = %ctx.workflow_id, "Running pipeline");
        self.executor.run(targets, ctx).await
    }
}
