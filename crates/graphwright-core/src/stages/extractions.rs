use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::sections::SECTIONS_TABLE;
use super::Scope;
use crate::document::{Section, DOCUMENTS_TABLE};
use crate::extraction::{ExtractionRecord, Extractor};
use crate::pipeline::{
    previous_state, ColumnType, CustomMetrics, Model, ModelSpec, Reference, Row, StageInput, TableSchema,
    TableWriter,
};
use crate::storage::{Storage, TableQuery, WriteStrategy};
use crate::Result;

pub const EXTRACTIONS_TABLE: &str = "extractions";

/// Runs the extractor over every section of the documents in play.
///
/// Sections whose text is unchanged since an earlier run carry that run's
/// extraction forward instead of calling the extractor again.
pub struct ExtractionsModel {
    spec: ModelSpec,
    extractor: Arc<dyn Extractor>,
}

impl ExtractionsModel {
    #[must_use]
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        let schema = TableSchema::new()
            .column("document_id", ColumnType::Text)
            .column("section_id", ColumnType::Text)
            .column("workflow_id", ColumnType::Text)
            .column("text_hash", ColumnType::Text)
            .column("reused", ColumnType::Boolean)
            .column("entities", ColumnType::Json)
            .column("relationships", ColumnType::Json)
            .column("claims", ColumnType::Json)
            .column("telemetry", ColumnType::Json);

        Self {
            spec: ModelSpec::new(EXTRACTIONS_TABLE, schema)
                .with_primary_key(&["document_id", "section_id", "workflow_id"])
                .with_write_strategy(WriteStrategy::Merge)
                .with_reference("documents", Reference::scoped(DOCUMENTS_TABLE))
                .with_reference("sections", Reference::scoped(SECTIONS_TABLE)),
            extractor,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    extracted: usize,
    reused: usize,
    repeated: usize,
    failed: usize,
}

#[async_trait::async_trait]
impl Model for ExtractionsModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn run(&self, input: &StageInput, output: &mut TableWriter) -> Result<CustomMetrics> {
        let scope = Scope::load(input).await?;
        let workflow_id = input.context().workflow_id.as_str();
        let mut tally = Tally::default();

        for document_id in scope.document_ids() {
            let sections: Vec<Section> = input
                .reference("sections")?
                .filter_eq("document_id", document_id)
                .fetch_as()
                .await?;
            if sections.is_empty() {
                continue;
            }

            let current = records_by_section(current_rows(input.storage(), document_id, workflow_id).await?)?;
            let earlier = records_by_text(previous_state(input.storage(), EXTRACTIONS_TABLE, document_id, workflow_id).await?)?;

            for section in sections {
                // A retried step rewrites what it already produced.
                if let Some(record) = current
                    .get(&section.section_id)
                    .filter(|r| r.text_hash == section.text_hash)
                {
                    output.write_record(record)?;
                    tally.repeated += 1;
                    continue;
                }

                if let Some(previous) = earlier.get(&section.text_hash) {
                    let record = ExtractionRecord {
                        document_id: section.document_id.clone(),
                        section_id: section.section_id.clone(),
                        workflow_id: workflow_id.to_string(),
                        text_hash: section.text_hash.clone(),
                        reused: true,
                        extraction: previous.extraction.clone(),
                    };
                    output.write_record(&record)?;
                    tally.reused += 1;
                    continue;
                }

                match self.extractor.extract(&section).await {
                    Ok(extraction) => {
                        let record = ExtractionRecord {
                            document_id: section.document_id.clone(),
                            section_id: section.section_id.clone(),
                            workflow_id: workflow_id.to_string(),
                            text_hash: section.text_hash.clone(),
                            reused: false,
                            extraction,
                        };
                        output.write_record(&record)?;
                        tally.extracted += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            document_id,
                            section_id = %section.section_id,
                            extractor = self.extractor.name(),
                            "Extraction failed, document will not be marked indexed: {}",
                            e
                        );
                        tally.failed += 1;
                    }
                }
            }
        }

        tracing::debug!(?tally, "Extraction finished");

        let mut metrics = scope.metrics();
        metrics.insert("sections_extracted".into(), json!(tally.extracted));
        metrics.insert("sections_reused".into(), json!(tally.reused));
        metrics.insert("sections_repeated".into(), json!(tally.repeated));
        metrics.insert("extraction_failures".into(), json!(tally.failed));
        Ok(metrics)
    }
}

async fn current_rows(storage: &Storage, document_id: &str, workflow_id: &str) -> Result<Vec<Row>> {
    let query = TableQuery::new(EXTRACTIONS_TABLE)
        .filter_eq("document_id", document_id)
        .filter_eq("workflow_id", workflow_id);
    storage.query_rows(&query).await
}

fn decode(rows: Vec<Row>) -> Result<Vec<ExtractionRecord>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
        .collect()
}

fn records_by_section(rows: Vec<Row>) -> Result<HashMap<String, ExtractionRecord>> {
    Ok(decode(rows)?
        .into_iter()
        .map(|record| (record.section_id.clone(), record))
        .collect())
}

/// The first record seen for each text hash.
fn records_by_text(rows: Vec<Row>) -> Result<HashMap<String, ExtractionRecord>> {
    let mut by_text = HashMap::new();
    for record in decode(rows)? {
        by_text.entry(record.text_hash.clone()).or_insert(record);
    }
    Ok(by_text)
}
