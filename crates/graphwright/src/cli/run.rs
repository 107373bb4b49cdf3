use std::sync::Arc;

use anyhow::{bail, Context, Result};

use graphwright_core::pipeline::{CheckpointStepRunner, CheckpointStore, PipelineStatus};
use graphwright_core::resolution::InMemoryVectorIndex;
use graphwright_core::stages::graph_targets;
use graphwright_core::{
    register_graph_pipeline, GraphComponents, GraphwrightConfig, IncrementalMode, ModelRegistry, PipelineExecutor,
    PipelineResult, PipelineRunner, Storage, GRAPH_PIPELINE,
};

pub async fn run(
    config: &GraphwrightConfig,
    pipeline: &str,
    delta: bool,
    resume: Option<&str>,
    documents: Vec<String>,
) -> Result<()> {
    let storage = Storage::open(&config.database.path)
        .await
        .with_context(|| format!("opening database {}", config.database.path))?;

    let index = InMemoryVectorIndex::new();
    let warmed = index.warm_from(&storage).await?;
    tracing::debug!("Loaded {} entity embeddings", warmed);

    let components = GraphComponents::offline(config).with_vector_index(Arc::new(index));
    let registry = register_graph_pipeline(ModelRegistry::builder(), &components).build()?;

    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(storage.clone());
    let executor = PipelineExecutor::new(Arc::new(registry), storage)
        .with_config(config.executor.clone())
        .with_step_runner(Arc::new(CheckpointStepRunner::new(checkpoints)));

    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, letting running stages finish");
            token.cancel();
        }
    });

    let runner = PipelineRunner::new(executor).with_pipeline(GRAPH_PIPELINE, graph_targets());
    let scope = (!documents.is_empty()).then_some(documents);
    let mode = if delta {
        IncrementalMode::Delta
    } else {
        IncrementalMode::Full
    };

    let result = match resume {
        Some(workflow_id) => runner.resume(pipeline, workflow_id, scope, mode).await?,
        None => runner.run_pipeline(pipeline, scope, mode).await?,
    };

    print_result(&result);

    match result.status {
        PipelineStatus::Succeeded => Ok(()),
        status => bail!(
            "pipeline {pipeline} {status}; rerun with --resume {} to continue",
            result.workflow_id
        ),
    }
}

fn print_result(result: &PipelineResult) {
    eprintln!("Workflow {} ({})", result.workflow_id, result.status);
    for level in &result.levels {
        for report in &level.stages {
            eprintln!(
                "  [{}] {:<20} {:<9} written={} deduplicated={}",
                level.index,
                report.stage,
                report.outcome.as_str(),
                report.result.rows_written,
                report.result.rows_deduplicated
            );
            if !report.result.custom_metrics.is_empty() {
                let metrics = report
                    .result
                    .custom_metrics
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                eprintln!("      {metrics}");
            }
            if let Some(error) = &report.result.error {
                eprintln!("      error: {error}");
            }
        }
    }
    for stage in &result.not_scheduled {
        eprintln!("  [-] {stage:<20} not scheduled");
    }
    eprintln!(
        "  {} rows written, {} deduplicated in {}ms",
        result.rows_written, result.rows_deduplicated, result.duration_ms
    );
}
