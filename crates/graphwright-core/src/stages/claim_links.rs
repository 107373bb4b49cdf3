use std::sync::Arc;

use serde_json::json;

use super::extractions::EXTRACTIONS_TABLE;
use super::Scope;
use crate::config::ClaimConfig;
use crate::document::DOCUMENTS_TABLE;
use crate::extraction::ExtractionRecord;
use crate::pipeline::{ColumnType, CustomMetrics, Model, ModelSpec, Reference, StageInput, TableSchema, TableWriter};
use crate::resolution::{
    ClaimResolver, ConflictDetector, EntityMapping, ResolvedMention, CLAIM_LINKS_TABLE, ENTITY_MENTIONS_TABLE,
};
use crate::storage::WriteStrategy;
use crate::Result;

/// Deduplicates this workflow's claims into the graph and links each section
/// to the claims it supports.
pub struct ClaimLinksModel {
    spec: ModelSpec,
    detector: Arc<dyn ConflictDetector>,
    config: ClaimConfig,
}

impl ClaimLinksModel {
    #[must_use]
    pub fn new(detector: Arc<dyn ConflictDetector>, config: ClaimConfig) -> Self {
        let schema = TableSchema::new()
            .column("workflow_id", ColumnType::Text)
            .column("document_id", ColumnType::Text)
            .column("section_id", ColumnType::Text)
            .column("claim_id", ColumnType::Text)
            .column("signature", ColumnType::Text)
            .column("statement", ColumnType::Text)
            .column("entity_ids", ColumnType::Json)
            .column("confidence", ColumnType::Real)
            .nullable("conflicts_with", ColumnType::Text)
            .column("conflicting_claims", ColumnType::Json);

        Self {
            spec: ModelSpec::new(CLAIM_LINKS_TABLE, schema)
                .with_primary_key(&["workflow_id", "document_id", "section_id", "claim_id"])
                .with_write_strategy(WriteStrategy::Merge)
                .with_reference("documents", Reference::scoped(DOCUMENTS_TABLE))
                .with_reference("extractions", Reference::current_workflow(EXTRACTIONS_TABLE))
                .with_reference("mentions", Reference::current_workflow(ENTITY_MENTIONS_TABLE)),
            detector,
            config,
        }
    }
}

#[async_trait::async_trait]
impl Model for ClaimLinksModel {
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
            .filter(|r| scope.contains(&r.document_id) && !r.extraction.claims.is_empty())
            .collect();
        if records.is_empty() {
            return Ok(metrics);
        }

        let mentions: Vec<ResolvedMention> = input.reference("mentions")?.fetch_as().await?;
        let mapping = EntityMapping::from_mentions(&mentions);

        let resolver = ClaimResolver::new(input.storage().clone(), Arc::clone(&self.detector))
            .with_config(self.config.clone());
        let outcome = resolver
            .resolve(&input.context().workflow_id, &records, &mapping)
            .await?;

        output.write_records(&outcome.links)?;

        let counts = outcome.counts;
        metrics.insert("claims_extracted".into(), json!(counts.extracted));
        metrics.insert("claims_unique".into(), json!(counts.unique));
        metrics.insert("claims_created".into(), json!(counts.created));
        metrics.insert("claims_merged".into(), json!(counts.merged_existing));
        metrics.insert("conflicts".into(), json!(counts.conflicts));
        metrics.insert("conflict_check_failures".into(), json!(counts.detector_failures));
        Ok(metrics)
    }
}
