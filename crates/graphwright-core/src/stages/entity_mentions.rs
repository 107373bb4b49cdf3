use std::sync::Arc;

use serde_json::json;

use super::extractions::EXTRACTIONS_TABLE;
use super::Scope;
use crate::config::ResolutionConfig;
use crate::document::DOCUMENTS_TABLE;
use crate::extraction::ExtractionRecord;
use crate::pipeline::{ColumnType, CustomMetrics, Model, ModelSpec, Reference, StageInput, TableSchema, TableWriter};
use crate::resolution::{Embedder, EntityResolver, ResolutionOracle, VectorIndex, ENTITY_MENTIONS_TABLE};
use crate::storage::WriteStrategy;
use crate::Result;

/// Resolves every mention extracted in this workflow to a canonical entity.
pub struct EntityMentionsModel {
    spec: ModelSpec,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    oracle: Arc<dyn ResolutionOracle>,
    config: ResolutionConfig,
}

impl EntityMentionsModel {
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        oracle: Arc<dyn ResolutionOracle>,
        config: ResolutionConfig,
    ) -> Self {
        let schema = TableSchema::new()
            .column("workflow_id", ColumnType::Text)
            .column("document_id", ColumnType::Text)
            .column("section_id", ColumnType::Text)
            .column("mention_key", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("entity_type", ColumnType::Text)
            .column("entity_id", ColumnType::Text)
            .column("resolution", ColumnType::Text);

        Self {
            spec: ModelSpec::new(ENTITY_MENTIONS_TABLE, schema)
                .with_primary_key(&["workflow_id", "document_id", "section_id", "mention_key"])
                .with_write_strategy(WriteStrategy::Merge)
                .with_reference("documents", Reference::scoped(DOCUMENTS_TABLE))
                .with_reference("extractions", Reference::current_workflow(EXTRACTIONS_TABLE)),
            embedder,
            index,
            oracle,
            config,
        }
    }
}

#[async_trait::async_trait]
impl Model for EntityMentionsModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn run(&self, input: &StageInput, output: &mut TableWriter) -> Result<CustomMetrics> {
        let scope = Scope::load(input).await?;
        let mut metrics = scope.metrics();

        let records: Vec<ExtractionRecord> = input
            .reference("extractions")?
            .fetch_as::<ExtractionRecord>()
            .await?
            .into_iter()
            .filter(|r| scope.contains(&r.document_id))
            .collect();
        if records.is_empty() {
            return Ok(metrics);
        }

        let resolver = EntityResolver::new(
            input.storage().clone(),
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            Arc::clone(&self.oracle),
        )
        .with_config(self.config.clone());
        let outcome = resolver.resolve(&input.context().workflow_id, &records).await?;

        output.write_records(&outcome.mentions)?;

        let counts = outcome.counts;
        metrics.insert("mentions".into(), json!(counts.mentions));
        metrics.insert("linked".into(), json!(counts.linked));
        metrics.insert("clusters".into(), json!(counts.clusters));
        metrics.insert("entities_created".into(), json!(counts.entities_created));
        metrics.insert("merged_existing".into(), json!(counts.merged_existing));
        metrics.insert("merged_within_cluster".into(), json!(counts.merged_within_cluster));
        metrics.insert("document_links".into(), json!(counts.document_links));
        metrics.insert("relationships_created".into(), json!(counts.relationships_created));
        metrics.insert("relationships_skipped".into(), json!(counts.relationships_skipped));
        metrics.insert("validation_notes".into(), json!(outcome.notes.len()));
        Ok(metrics)
    }
}
