use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::extractions::EXTRACTIONS_TABLE;
use super::sections::SECTIONS_TABLE;
use super::Scope;
use crate::claim::normalize_statement;
use crate::document::{Section, DOCUMENTS_TABLE};
use crate::entity::normalize_name;
use crate::extraction::ExtractionRecord;
use crate::pipeline::{ColumnType, CustomMetrics, Model, ModelSpec, Reference, StageInput, TableSchema, TableWriter};
use crate::resolution::{CLAIM_LINKS_TABLE, ENTITY_MENTIONS_TABLE};
use crate::storage::{TableQuery, WriteStrategy};
use crate::Result;

pub const INDEXED_DOCUMENTS_TABLE: &str = "indexed_documents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexedDocument {
    document_id: String,
    workflow_id: String,
    fingerprint: String,
    sections: u64,
}

/// Final stage: records the fingerprint each processed document was indexed
/// with, which is what later delta runs compare against.
///
/// A document is only recorded when every one of its sections has an
/// extraction in this workflow and every section that extracted entities or
/// claims also has resolved mentions or claim links. The document itself is
/// marked indexed once those rows are committed.
pub struct IndexedDocumentsModel {
    spec: ModelSpec,
}

impl IndexedDocumentsModel {
    #[must_use]
    pub fn new() -> Self {
        let schema = TableSchema::new()
            .column("document_id", ColumnType::Text)
            .column("workflow_id", ColumnType::Text)
            .column("fingerprint", ColumnType::Text)
            .column("sections", ColumnType::Integer);

        Self {
            spec: ModelSpec::new(INDEXED_DOCUMENTS_TABLE, schema)
                .with_primary_key(&["document_id"])
                .with_write_strategy(WriteStrategy::Merge)
                .with_reference("documents", Reference::scoped(DOCUMENTS_TABLE))
                .with_reference("sections", Reference::scoped(SECTIONS_TABLE))
                .with_reference("extractions", Reference::current_workflow(EXTRACTIONS_TABLE))
                .with_reference("entity_mentions", Reference::current_workflow(ENTITY_MENTIONS_TABLE))
                .with_reference("claim_links", Reference::current_workflow(CLAIM_LINKS_TABLE)),
        }
    }
}

impl Default for IndexedDocumentsModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Section ids of one document that have rows in a referenced table.
async fn covered_sections(input: &StageInput, alias: &str, document_id: &str) -> Result<HashSet<String>> {
    Ok(input
        .reference(alias)?
        .filter_eq("document_id", document_id)
        .fetch()
        .await?
        .into_iter()
        .filter_map(|row| row.get("section_id").and_then(Value::as_str).map(str::to_string))
        .collect())
}

fn resolved(record: &ExtractionRecord, mentioned: &HashSet<String>, linked: &HashSet<String>) -> bool {
    let has_entities = record
        .extraction
        .entities
        .iter()
        .any(|e| !normalize_name(&e.name).is_empty());
    let has_claims = record
        .extraction
        .claims
        .iter()
        .any(|c| !normalize_statement(&c.statement).is_empty());
    (!has_entities || mentioned.contains(&record.section_id)) && (!has_claims || linked.contains(&record.section_id))
}

#[async_trait::async_trait]
impl Model for IndexedDocumentsModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn run(&self, input: &StageInput, output: &mut TableWriter) -> Result<CustomMetrics> {
        let scope = Scope::load(input).await?;
        let mut indexed = 0;
        let mut incomplete = 0;

        for (document, fingerprint) in &scope.process {
            let document_id = document.document_id.as_str();
            let sections: Vec<Section> = input
                .reference("sections")?
                .filter_eq("document_id", document_id)
                .fetch_as()
                .await?;
            let records: Vec<ExtractionRecord> = input
                .reference("extractions")?
                .filter_eq("document_id", document_id)
                .fetch_as()
                .await?;
            let extracted: HashSet<&str> = records.iter().map(|r| r.section_id.as_str()).collect();

            if let Some(missing) = sections.iter().find(|s| !extracted.contains(s.section_id.as_str())) {
                tracing::warn!(
                    document_id,
                    section_id = %missing.section_id,
                    "Section has no extraction in this workflow, leaving document unindexed"
                );
                incomplete += 1;
                continue;
            }

            let mentioned = covered_sections(input, "entity_mentions", document_id).await?;
            let linked = covered_sections(input, "claim_links", document_id).await?;
            if let Some(unresolved) = records.iter().find(|r| !resolved(r, &mentioned, &linked)) {
                tracing::warn!(
                    document_id,
                    section_id = %unresolved.section_id,
                    "Section was not resolved in this workflow, leaving document unindexed"
                );
                incomplete += 1;
                continue;
            }

            output.write_record(&IndexedDocument {
                document_id: document_id.to_string(),
                workflow_id: input.context().workflow_id.clone(),
                fingerprint: fingerprint.clone(),
                sections: u64::try_from(sections.len()).unwrap_or(u64::MAX),
            })?;
            indexed += 1;
        }

        let mut metrics = scope.metrics();
        metrics.insert("documents_indexed".into(), json!(indexed));
        metrics.insert("documents_incomplete".into(), json!(incomplete));
        Ok(metrics)
    }

    async fn after_commit(&self, input: &StageInput) -> Result<()> {
        let query = TableQuery::new(INDEXED_DOCUMENTS_TABLE)
            .filter_eq("workflow_id", input.context().workflow_id.as_str());
        for row in input.storage().query_rows(&query).await? {
            let record: IndexedDocument = serde_json::from_value(Value::Object(row))?;
            input.storage().mark_indexed(&record.document_id, &record.fingerprint).await?;
        }
        Ok(())
    }
}
