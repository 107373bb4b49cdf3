use serde_json::json;

use super::Scope;
use crate::document::{split_sections, DOCUMENTS_TABLE};
use crate::pipeline::{
    ColumnType, ConfigSchema, CustomMetrics, Model, ModelSpec, Reference, StageInput, TableSchema, TableWriter,
};
use crate::storage::WriteStrategy;
use crate::Result;

pub const SECTIONS_TABLE: &str = "sections";

const DEFAULT_MAX_CHARS: u64 = 2000;

/// Splits each document into paragraph-aligned sections.
///
/// Writes with `replace`, so sections that disappear from an edited document
/// are dropped.
pub struct SectionsModel {
    spec: ModelSpec,
}

impl SectionsModel {
    #[must_use]
    pub fn new() -> Self {
        let schema = TableSchema::new()
            .column("document_id", ColumnType::Text)
            .column("section_id", ColumnType::Text)
            .column("ordinal", ColumnType::Integer)
            .column("text", ColumnType::Text)
            .column("text_hash", ColumnType::Text)
            .column("start_offset", ColumnType::Integer)
            .column("end_offset", ColumnType::Integer);

        Self {
            spec: ModelSpec::new(SECTIONS_TABLE, schema)
                .with_primary_key(&["document_id", "section_id"])
                .with_write_strategy(WriteStrategy::Replace)
                .with_reference("documents", Reference::scoped(DOCUMENTS_TABLE))
                .with_config_schema(ConfigSchema::new().field("max_chars", ColumnType::Integer, DEFAULT_MAX_CHARS)),
        }
    }
}

impl Default for SectionsModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Model for SectionsModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn run(&self, input: &StageInput, output: &mut TableWriter) -> Result<CustomMetrics> {
        let scope = Scope::load(input).await?;
        let max_chars = input
            .config()
            .get_u64("max_chars")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(2000)
            .max(1);

        let mut total = 0;
        for (document, _) in &scope.process {
            output.claim_document(document.document_id.clone());
            let sections = split_sections(&document.document_id, &document.content, max_chars);
            total += sections.len();
            output.write_records(&sections)?;
        }

        let mut metrics = scope.metrics();
        metrics.insert("sections".into(), json!(total));
        Ok(metrics)
    }
}
