use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::PipelineContext;
use super::dag::ExecutionPlan;
use super::model::{Model, StageInput, StageResult};
use super::reference::TableRef;
use super::registry::ModelRegistry;
use super::schema::StageConfig;
use super::step::{DirectStepRunner, StepFuture, StepOutcome, StepRunner};
use super::writer::TableWriter;
use crate::config::ExecutorConfig;
use crate::storage::Storage;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// Completed by an earlier attempt of the same workflow.
    Resumed,
    Failed,
}

impl StageOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Resumed => "resumed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    /// Cancelled before every level was scheduled.
    Cancelled,
}

impl PipelineStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,
    pub result: StageResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelReport {
    pub index: usize,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub workflow_id: String,
    pub status: PipelineStatus,
    pub levels: Vec<LevelReport>,
    /// Stages never started because of a failure or cancellation.
    pub not_scheduled: Vec<String>,
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    pub duration_ms: u64,
}

impl PipelineResult {
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.levels
            .iter()
            .flat_map(|level| &level.stages)
            .find(|report| report.stage == name)
    }

    pub fn failed_stages(&self) -> impl Iterator<Item = &StageReport> {
        self.levels
            .iter()
            .flat_map(|level| &level.stages)
            .filter(|report| report.outcome == StageOutcome::Failed)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageStarted {
        workflow_id: String,
        stage: String,
        level: usize,
    },
    StageFinished {
        workflow_id: String,
        stage: String,
        level: usize,
        outcome: StageOutcome,
        result: StageResult,
    },
}

/// Runs an execution plan level by level against one store.
pub struct PipelineExecutor {
    registry: Arc<ModelRegistry>,
    storage: Storage,
    step_runner: Arc<dyn StepRunner>,
    config: ExecutorConfig,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    cancellation: CancellationToken,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, storage: Storage) -> Self {
        Self {
            registry,
            storage,
            step_runner: Arc::new(DirectStepRunner),
            config: ExecutorConfig::default(),
            events: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = runner;
        self
    }

    #[must_use]
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that stops further levels from being scheduled when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Runs the named stages and everything upstream of them. An empty list runs
    /// every registered stage. Plan errors are returned before any stage starts.
    pub async fn run(&self, stage_names: &[String], ctx: PipelineContext) -> Result<PipelineResult> {
        let plan = ExecutionPlan::for_targets(&self.registry, stage_names)?;
        Ok(self.run_plan(&plan, ctx).await)
    }

    pub async fn run_plan(&self, plan: &ExecutionPlan, ctx: PipelineContext) -> PipelineResult {
        let started = Instant::now();
        let ctx = Arc::new(ctx);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            mode = %ctx.incremental_mode,
            "Starting pipeline: {}",
            plan.describe()
        );

        let mut status = PipelineStatus::Succeeded;
        let mut levels = Vec::with_capacity(plan.levels().len());
        let mut not_scheduled = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();

        for (index, level) in plan.levels().iter().enumerate() {
            if self.cancellation.is_cancelled() {
                tracing::warn!(workflow_id = %ctx.workflow_id, "Pipeline cancelled before level {}", index);
                status = PipelineStatus::Cancelled;
                not_scheduled.extend(plan.levels()[index..].iter().flatten().cloned());
                break;
            }

            // Without stop_on_error a failure still blocks everything downstream of it.
            let (runnable, skipped): (Vec<String>, Vec<String>) = level
                .iter()
                .cloned()
                .partition(|stage| !plan.upstream_of(stage).any(|up| blocked.contains(up)));
            if !skipped.is_empty() {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    "Not scheduling {} after upstream failure: {}",
                    skipped.len(),
                    skipped.join(", ")
                );
                blocked.extend(skipped.iter().cloned());
                not_scheduled.extend(skipped);
            }
            if runnable.is_empty() {
                continue;
            }

            let report = self.run_level(index, &runnable, &ctx, &semaphore).await;
            let mut failed = false;
            for stage in report.stages.iter().filter(|s| s.outcome == StageOutcome::Failed) {
                blocked.insert(stage.stage.clone());
                failed = true;
            }
            levels.push(report);

            if failed {
                status = PipelineStatus::Failed;
                if self.config.stop_on_error {
                    not_scheduled.extend(plan.levels()[index + 1..].iter().flatten().cloned());
                    tracing::error!(
                        workflow_id = %ctx.workflow_id,
                        "Level {} failed, not scheduling {} remaining stages",
                        index,
                        not_scheduled.len()
                    );
                    break;
                }
            }
        }

        let executed = levels
            .iter()
            .flat_map(|level: &LevelReport| &level.stages)
            .filter(|s| s.outcome == StageOutcome::Succeeded);
        let (rows_written, rows_deduplicated) = executed.fold((0, 0), |(w, d), s| {
            (w + s.result.rows_written, d + s.result.rows_deduplicated)
        });

        let result = PipelineResult {
            workflow_id: ctx.workflow_id.clone(),
            status,
            levels,
            not_scheduled,
            rows_written,
            rows_deduplicated,
            duration_ms: elapsed_ms(started),
        };

        tracing::info!(
            workflow_id = %result.workflow_id,
            status = %result.status,
            rows_written = result.rows_written,
            rows_deduplicated = result.rows_deduplicated,
            "Pipeline finished in {}ms",
            result.duration_ms
        );

        result
    }

    async fn run_level(
        &self,
        index: usize,
        level: &[String],
        ctx: &Arc<PipelineContext>,
        semaphore: &Arc<Semaphore>,
    ) -> LevelReport {
        let mut set = JoinSet::new();
        let mut reports: HashMap<String, StageReport> = HashMap::new();

        for stage in level {
            let model = match self.registry.model(stage) {
                Ok(model) => model,
                Err(e) => {
                    reports.insert(stage.clone(), failed_report(stage, &e));
                    continue;
                }
            };

            let step = self.stage_future(model, Arc::clone(ctx));
            let runner = Arc::clone(&self.step_runner);
            let semaphore = Arc::clone(semaphore);
            let events = self.events.clone();
            let workflow_id = ctx.workflow_id.clone();
            let stage = stage.clone();
            let span = tracing::info_span!("stage", workflow_id = %workflow_id, stage = %stage, level = index);

            set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    emit(
                        events.as_ref(),
                        PipelineEvent::StageStarted {
                            workflow_id: workflow_id.clone(),
                            stage: stage.clone(),
                            level: index,
                        },
                    );
                    tracing::info!("Stage started");

                    let report = match runner.execute(&workflow_id, &stage, step).await {
                        Ok(StepOutcome::Executed(result)) => StageReport {
                            outcome: if result.is_success() {
                                StageOutcome::Succeeded
                            } else {
                                StageOutcome::Failed
                            },
                            stage: stage.clone(),
                            result,
                        },
                        Ok(StepOutcome::Resumed(result)) => StageReport {
                            outcome: StageOutcome::Resumed,
                            stage: stage.clone(),
                            result,
                        },
                        Err(e) => failed_report(&stage, &e),
                    };

                    match &report.result.error {
                        Some(error) => tracing::error!("Stage failed: {}", error),
                        None => tracing::info!(
                            outcome = %report.outcome,
                            rows_written = report.result.rows_written,
                            rows_deduplicated = report.result.rows_deduplicated,
                            "Stage finished in {}ms",
                            report.result.duration_ms
                        ),
                    }

                    emit(
                        events.as_ref(),
                        PipelineEvent::StageFinished {
                            workflow_id,
                            stage: stage.clone(),
                            level: index,
                            outcome: report.outcome,
                            result: report.result.clone(),
                        },
                    );
                    report
                }
                .instrument(span),
            );
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    reports.insert(report.stage.clone(), report);
                }
                Err(e) => tracing::error!("Stage task did not complete: {}", e),
            }
        }

        let stages = level
            .iter()
            .map(|stage| {
                reports.remove(stage).unwrap_or_else(|| {
                    failed_report(
                        stage,
                        &Error::StageFailed {
                            stage: stage.clone(),
                            message: "stage task did not complete".to_string(),
                        },
                    )
                })
            })
            .collect();

        LevelReport { index, stages }
    }

    /// The body handed to the step runner: resolve references, run, commit.
    fn stage_future(&self, model: Arc<dyn Model>, ctx: Arc<PipelineContext>) -> StepFuture {
        let storage = self.storage.clone();
        let registry = Arc::clone(&self.registry);
        let timeout = model
            .spec()
            .timeout
            .unwrap_or_else(|| self.config.default_timeout());

        async move {
            let started = Instant::now();
            let stage = model.spec().name.clone();
            let body = AssertUnwindSafe(invoke_stage(model, registry, storage, ctx)).catch_unwind();

            let mut result = match tokio::time::timeout(timeout, body).await {
                Ok(Ok(Ok(result))) => result,
                Ok(Ok(Err(e))) => StageResult::failed(e),
                Ok(Err(_)) => StageResult::failed(Error::StageFailed {
                    stage,
                    message: "stage panicked".to_string(),
                }),
                Err(_) => StageResult::failed(Error::StageTimeout {
                    stage,
                    timeout_ms: duration_ms(timeout),
                }),
            };
            result.duration_ms = elapsed_ms(started);
            result
        }
        .boxed()
    }
}

async fn invoke_stage(
    model: Arc<dyn Model>,
    registry: Arc<ModelRegistry>,
    storage: Storage,
    ctx: Arc<PipelineContext>,
) -> Result<StageResult> {
    let spec = model.spec();

    let config = match &spec.config_schema {
        Some(schema) => schema.resolve(&spec.name, ctx.stage_config(&spec.name))?,
        None => StageConfig::default(),
    };

    let references = spec
        .references
        .iter()
        .map(|(alias, reference)| {
            let has_document_column = registry
                .table_schema(&reference.table)
                .is_none_or(|schema| schema.has_column("document_id"));
            (
                alias.clone(),
                TableRef::resolve(storage.clone(), reference, &ctx, has_document_column),
            )
        })
        .collect();

    let input = StageInput::new(
        spec.name.clone(),
        Arc::clone(&ctx),
        references,
        config,
        storage.clone(),
    );
    let mut writer = TableWriter::new(storage, spec.clone(), ctx.workflow_id.clone());

    let custom_metrics = model.run(&input, &mut writer).await?;
    let outcome = writer.finish().await?;
    model.after_commit(&input).await?;

    Ok(StageResult {
        rows_written: outcome.rows_written,
        rows_deduplicated: outcome.rows_deduplicated,
        rows_deleted: outcome.rows_deleted,
        custom_metrics,
        error: None,
        duration_ms: 0,
    })
}

fn failed_report(stage: &str, error: &Error) -> StageReport {
    StageReport {
        stage: stage.to_string(),
        outcome: StageOutcome::Failed,
        result: StageResult::failed(error),
    }
}

fn emit(events: Option<&mpsc::UnboundedSender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(sender) = events {
        // A dropped receiver only means nobody is listening.
        let _ = sender.send(event);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}
