use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::PipelineContext;
use super::schema::Row;
use crate::storage::{Storage, TableQuery};
use crate::Result;

/// Builds a restricted query from the run context.
pub type FilterFn = Arc<dyn Fn(&PipelineContext, TableQuery) -> TableQuery + Send + Sync>;

#[derive(Clone)]
pub enum ReferenceFilter {
    /// Restrict to the run's document ids (when the table has a `document_id` column).
    DocumentScope,
    /// Restrict with a function of the context, e.g. to the current workflow.
    Custom(FilterFn),
    /// Load the whole table.
    Unrestricted,
}

impl std::fmt::Debug for ReferenceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentScope => f.write_str("DocumentScope"),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::Unrestricted => f.write_str("Unrestricted"),
        }
    }
}

/// A declared dependency on another table.
#[derive(Debug, Clone)]
pub struct Reference {
    pub table: String,
    pub filter: ReferenceFilter,
}

impl Reference {
    #[must_use]
    pub fn scoped(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: ReferenceFilter::DocumentScope,
        }
    }

    #[must_use]
    pub fn filtered<F>(table: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&PipelineContext, TableQuery) -> TableQuery + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            filter: ReferenceFilter::Custom(Arc::new(filter)),
        }
    }

    /// Rows written by the current workflow for the documents in scope.
    #[must_use]
    pub fn current_workflow(table: impl Into<String>) -> Self {
        Self::filtered(table, |ctx, query| {
            let query = query.filter_eq("workflow_id", ctx.workflow_id.as_str());
            match &ctx.document_ids {
                Some(ids) => query.filter_in("document_id", ids.iter().map(String::as_str)),
                None => query,
            }
        })
    }

    #[must_use]
    pub fn unrestricted(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: ReferenceFilter::Unrestricted,
        }
    }
}

/// Lazy handle to a referenced table. Nothing is read until `fetch` or `count`.
#[derive(Debug, Clone)]
pub struct TableRef {
    storage: Storage,
    query: TableQuery,
}

impl TableRef {
    pub(crate) fn resolve(
        storage: Storage,
        reference: &Reference,
        ctx: &PipelineContext,
        has_document_column: bool,
    ) -> Self {
        let query = TableQuery::new(reference.table.clone());
        let query = match &reference.filter {
            ReferenceFilter::DocumentScope => match &ctx.document_ids {
                Some(ids) if has_document_column => {
                    query.filter_in("document_id", ids.iter().map(String::as_str))
                }
                _ => query,
            },
            ReferenceFilter::Custom(filter) => filter(ctx, query),
            ReferenceFilter::Unrestricted => {
                tracing::debug!(table = %reference.table, "Unrestricted reference loads the full table");
                query
            }
        };
        Self { storage, query }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        self.query.table()
    }

    #[must_use]
    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.query = self.query.filter_eq(column, value);
        self
    }

    #[must_use]
    pub fn filter_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.query = self.query.filter_in(column, values);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    pub async fn fetch(&self) -> Result<Vec<Row>> {
        self.storage.query_rows(&self.query).await
    }

    pub async fn fetch_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.fetch()
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
            .collect()
    }

    pub async fn count(&self) -> Result<u64> {
        self.storage.count_rows(&self.query).await
    }
}
