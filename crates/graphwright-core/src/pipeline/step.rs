use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use super::model::StageResult;
use crate::Result;

/// The deferred body of one stage invocation.
pub type StepFuture = BoxFuture<'static, StageResult>;

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step body ran in this invocation.
    Executed(StageResult),
    /// A prior attempt of this workflow already completed the step.
    Resumed(StageResult),
}

impl StepOutcome {
    #[must_use]
    pub const fn result(&self) -> &StageResult {
        match self {
            Self::Executed(result) | Self::Resumed(result) => result,
        }
    }

    #[must_use]
    pub fn into_result(self) -> StageResult {
        match self {
            Self::Executed(result) | Self::Resumed(result) => result,
        }
    }
}

/// Wraps each stage invocation, identified by `(workflow_id, stage)`.
///
/// Implementations give at-least-once execution and must not re-run a step
/// that already succeeded for the same workflow.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute(&self, workflow_id: &str, stage: &str, step: StepFuture) -> Result<StepOutcome>;
}

/// Runs every step with no durability.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectStepRunner;

#[async_trait::async_trait]
impl StepRunner for DirectStepRunner {
    async fn execute(&self, _workflow_id: &str, _stage: &str, step: StepFuture) -> Result<StepOutcome> {
        Ok(StepOutcome::Executed(step.await))
    }
}

/// Persistence for completed steps.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_step(&self, workflow_id: &str, stage: &str) -> Result<Option<StageResult>>;

    async fn save_step(&self, workflow_id: &str, stage: &str, result: &StageResult) -> Result<()>;

    async fn completed_steps(&self, workflow_id: &str) -> Result<Vec<String>>;

    async fn clear_workflow(&self, workflow_id: &str) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    steps: Mutex<HashMap<(String, String), StageResult>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load_step(&self, workflow_id: &str, stage: &str) -> Result<Option<StageResult>> {
        let steps = self.steps.lock().await;
        Ok(steps
            .get(&(workflow_id.to_string(), stage.to_string()))
            .cloned())
    }

    async fn save_step(&self, workflow_id: &str, stage: &str, result: &StageResult) -> Result<()> {
        self.steps
            .lock()
            .await
            .insert((workflow_id.to_string(), stage.to_string()), result.clone());
        Ok(())
    }

    async fn completed_steps(&self, workflow_id: &str) -> Result<Vec<String>> {
        let steps = self.steps.lock().await;
        let mut completed: Vec<String> = steps
            .keys()
            .filter(|(wf, _)| wf == workflow_id)
            .map(|(_, stage)| stage.clone())
            .collect();
        completed.sort();
        Ok(completed)
    }

    async fn clear_workflow(&self, workflow_id: &str) -> Result<u64> {
        let mut steps = self.steps.lock().await;
        let before = steps.len();
        steps.retain(|(wf, _), _| wf != workflow_id);
        Ok(u64::try_from(before - steps.len()).unwrap_or_default())
    }
}

/// Step runner that checkpoints successful steps and skips them on resume.
///
/// Failed results are not checkpointed, so a retried workflow runs them again.
#[derive(Clone)]
pub struct CheckpointStepRunner {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointStepRunner {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl StepRunner for CheckpointStepRunner {
    async fn execute(&self, workflow_id: &str, stage: &str, step: StepFuture) -> Result<StepOutcome> {
        if let Some(previous) = self.store.load_step(workflow_id, stage).await? {
            tracing::info!(workflow_id, stage, "Step already completed, resuming past it");
            return Ok(StepOutcome::Resumed(previous));
        }

        let result = step.await;
        if result.is_success() {
            self.store.save_step(workflow_id, stage, &result).await?;
        }
        Ok(StepOutcome::Executed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: &Arc<AtomicUsize>, result: StageResult) -> StepFuture {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_successful_steps_are_not_rerun() {
        let runner = CheckpointStepRunner::new(Arc::new(InMemoryCheckpointStore::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = StageResult {
            rows_written: 2,
            ..StageResult::default()
        };

        let first = runner.execute("w1", "a", counted(&calls, ok.clone())).await.unwrap();
        assert!(matches!(first, StepOutcome::Executed(_)));

        let second = runner.execute("w1", "a", counted(&calls, ok.clone())).await.unwrap();
        assert_eq!(second, StepOutcome::Resumed(ok.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        runner.execute("w2", "a", counted(&calls, ok)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_steps_are_retried() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let runner = CheckpointStepRunner::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        runner
            .execute("w1", "a", counted(&calls, StageResult::failed("boom")))
            .await
            .unwrap();
        assert!(store.completed_steps("w1").await.unwrap().is_empty());

        let retry = runner
            .execute("w1", "a", counted(&calls, StageResult::default()))
            .await
            .unwrap();
        assert!(matches!(retry, StepOutcome::Executed(r) if r.is_success()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.completed_steps("w1").await.unwrap(), vec!["a".to_string()]);
    }
}
