use chrono::Utc;

use super::Storage;
use crate::pipeline::{CheckpointStore, StageResult};
use crate::Result;

#[async_trait::async_trait]
impl CheckpointStore for Storage {
    async fn load_step(&self, workflow_id: &str, stage: &str) -> Result<Option<StageResult>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT result FROM pipeline_steps WHERE workflow_id = ? AND stage = ?")
                .bind(workflow_id)
                .bind(stage)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((result,)) => Ok(Some(serde_json::from_str(&result)?)),
            None => Ok(None),
        }
    }

    async fn save_step(&self, workflow_id: &str, stage: &str, result: &StageResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_steps (workflow_id, stage, result, completed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workflow_id, stage) DO UPDATE SET
                result = excluded.result,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(workflow_id)
        .bind(stage)
        .bind(serde_json::to_string(result)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn completed_steps(&self, workflow_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT stage FROM pipeline_steps WHERE workflow_id = ? ORDER BY completed_at, stage",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(stage,)| stage).collect())
    }

    async fn clear_workflow(&self, workflow_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pipeline_steps WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_steps_round_trip_through_sqlite() {
        let storage = Storage::open_memory().await.unwrap();
        assert!(storage.load_step("w1", "sections").await.unwrap().is_none());

        let result = StageResult {
            rows_written: 3,
            ..StageResult::default()
        };
        storage.save_step("w1", "sections", &result).await.unwrap();
        storage.save_step("w1", "extractions", &result).await.unwrap();
        storage.save_step("w2", "sections", &result).await.unwrap();

        let loaded = storage.load_step("w1", "sections").await.unwrap().unwrap();
        assert_eq!(loaded.rows_written, 3);

        let mut steps = storage.completed_steps("w1").await.unwrap();
        steps.sort();
        assert_eq!(steps, vec!["extractions".to_string(), "sections".to_string()]);

        assert_eq!(storage.clear_workflow("w1").await.unwrap(), 2);
        assert!(storage.completed_steps("w1").await.unwrap().is_empty());
        assert_eq!(storage.completed_steps("w2").await.unwrap().len(), 1);
    }
}
