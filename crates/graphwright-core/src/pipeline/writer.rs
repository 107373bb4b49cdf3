use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use super::model::ModelSpec;
use super::schema::Row;
use crate::storage::{Storage, TableWrite, WriteOutcome};
use crate::{Error, Result};

/// Buffers a stage's output and commits it in one transaction when the stage ends.
///
/// Rows are validated against the output schema as they are written, so a bad
/// row fails the stage before anything reaches the table.
pub struct TableWriter {
    storage: Storage,
    spec: ModelSpec,
    workflow_id: String,
    rows: Vec<Row>,
    replace_scope: BTreeSet<String>,
}

impl TableWriter {
    pub(crate) fn new(storage: Storage, spec: ModelSpec, workflow_id: String) -> Self {
        Self {
            storage,
            spec,
            workflow_id,
            rows: Vec::new(),
            replace_scope: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.spec.name
    }

    pub fn write(&mut self, row: Row) -> Result<()> {
        self.spec.schema.validate_row(&self.spec.name, &row)?;
        self.rows.push(row);
        Ok(())
    }

    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        match serde_json::to_value(record)? {
            Value::Object(row) => self.write(row),
            other => Err(Error::SchemaViolation {
                table: self.spec.name.clone(),
                message: format!("record is not an object: {other}"),
            }),
        }
    }

    pub fn write_records<T: Serialize>(&mut self, records: &[T]) -> Result<()> {
        for record in records {
            self.write_record(record)?;
        }
        Ok(())
    }

    /// Marks a document as owned by this write even if no rows mention it,
    /// so a replace write clears its stale rows.
    pub fn claim_document(&mut self, document_id: impl Into<String>) {
        self.replace_scope.insert(document_id.into());
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.rows.len()
    }

    pub(crate) async fn finish(self) -> Result<WriteOutcome> {
        let Self {
            storage,
            spec,
            workflow_id,
            rows,
            replace_scope,
        } = self;

        if rows.is_empty() && replace_scope.is_empty() {
            return Ok(WriteOutcome::default());
        }

        let write = TableWrite {
            table: &spec.name,
            primary_key: &spec.primary_key,
            strategy: spec.write_strategy,
            workflow_id: &workflow_id,
            replace_scope: &replace_scope,
        };
        storage.write_rows(&write, rows).await
    }
}
