use std::collections::BTreeSet;

use serde_json::Value;

use super::table::{TableWrite, WriteOutcome, WriteStrategy};
use super::{Storage, TableQuery};
use crate::document::{document_schema, Document, DOCUMENTS_TABLE};
use crate::pipeline::schema::Row;
use crate::{Error, Result};

fn document_row(document: &Document) -> Result<Row> {
    match serde_json::to_value(document)? {
        Value::Object(row) => Ok(row),
        _ => Err(Error::corrupt(DOCUMENTS_TABLE, "document did not serialize to an object")),
    }
}

impl Storage {
    /// Stores documents, keeping `indexed_with_hash` from any earlier version.
    pub async fn upsert_documents(&self, documents: &[Document]) -> Result<WriteOutcome> {
        let schema = document_schema();
        let mut rows = Vec::with_capacity(documents.len());
        for document in documents {
            let mut document = document.clone();
            if document.indexed_with_hash.is_none() {
                document.indexed_with_hash = self
                    .get_document(&document.document_id)
                    .await?
                    .and_then(|existing| existing.indexed_with_hash);
            }
            let row = document_row(&document)?;
            schema.validate_row(DOCUMENTS_TABLE, &row)?;
            rows.push(row);
        }

        self.write_documents(rows).await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let query = TableQuery::new(DOCUMENTS_TABLE).filter_eq("document_id", document_id);
        match self.query_rows(&query).await?.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(Value::Object(row))?)),
            None => Ok(None),
        }
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.query_rows(&TableQuery::new(DOCUMENTS_TABLE))
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
            .collect()
    }

    /// Records that `fingerprint` was processed to completion for the document.
    pub async fn mark_indexed(&self, document_id: &str, fingerprint: &str) -> Result<bool> {
        let Some(mut document) = self.get_document(document_id).await? else {
            return Ok(false);
        };
        document.indexed_with_hash = Some(fingerprint.to_string());
        let outcome = self.write_documents(vec![document_row(&document)?]).await?;
        Ok(outcome.rows_written > 0)
    }

    async fn write_documents(&self, rows: Vec<Row>) -> Result<WriteOutcome> {
        let primary_key = ["document_id".to_string()];
        let scope = BTreeSet::new();
        let write = TableWrite {
            table: DOCUMENTS_TABLE,
            primary_key: &primary_key,
            strategy: WriteStrategy::Merge,
            workflow_id: "ingest",
            replace_scope: &scope,
        };
        self.write_rows(&write, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reingest_keeps_index_marker() {
        let storage = Storage::open_memory().await.unwrap();
        let doc = Document::new("d1", "first version");
        storage.upsert_documents(&[doc.clone()]).await.unwrap();
        assert!(storage.mark_indexed("d1", &doc.content_hash).await.unwrap());

        storage
            .upsert_documents(&[Document::new("d1", "second version")])
            .await
            .unwrap();
        let stored = storage.get_document("d1").await.unwrap().unwrap();
        assert_eq!(stored.content, "second version");
        assert_eq!(stored.indexed_with_hash, Some(doc.content_hash));

        assert!(!storage.mark_indexed("missing", "x").await.unwrap());
        assert_eq!(storage.list_documents().await.unwrap().len(), 1);
    }
}
