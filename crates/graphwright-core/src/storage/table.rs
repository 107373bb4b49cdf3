use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Sqlite};

use super::Storage;
use crate::pipeline::schema::Row;
use crate::{Error, Result};

const DOCUMENT_COLUMN: &str = "document_id";
const WORKFLOW_COLUMN: &str = "workflow_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Insert; rows whose key already exists are left alone.
    Append,
    /// Upsert by primary key.
    Merge,
    /// Upsert, then drop rows of the touched documents that were not rewritten.
    Replace,
}

impl WriteStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WriteStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "append" => Ok(Self::Append),
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            _ => Err(Error::InvalidWriteStrategy(s.to_string())),
        }
    }
}

/// Table and column names end up in SQL text, so only plain identifiers pass.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

fn physical_name(table: &str) -> String {
    format!("\"tbl_{table}\"")
}

fn column_expr(column: &str) -> String {
    match column {
        DOCUMENT_COLUMN | WORKFLOW_COLUMN => column.to_string(),
        _ => format!("json_extract(data, '$.{column}')"),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
}

/// A filtered read over one logical table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    table: String,
    conditions: Vec<Condition>,
    limit: Option<usize>,
}

impl TableQuery {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn filter_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.push(Condition::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) -> Result<()> {
        qb.push(" WHERE 1 = 1");
        for condition in &self.conditions {
            match condition {
                Condition::Eq(column, Value::Null) => {
                    validate_identifier(column)?;
                    qb.push(" AND ");
                    qb.push(column_expr(column));
                    qb.push(" IS NULL");
                }
                Condition::Eq(column, value) => {
                    validate_identifier(column)?;
                    qb.push(" AND ");
                    qb.push(column_expr(column));
                    qb.push(" = ");
                    push_value(qb, value);
                }
                Condition::In(_, values) if values.is_empty() => {
                    qb.push(" AND 1 = 0");
                }
                Condition::In(column, values) => {
                    validate_identifier(column)?;
                    qb.push(" AND ");
                    qb.push(column_expr(column));
                    qb.push(" IN (");
                    let mut separated = qb.separated(", ");
                    for value in values {
                        match bind_value(value) {
                            Bound::Text(s) => separated.push_bind(s),
                            Bound::Int(i) => separated.push_bind(i),
                            Bound::Real(r) => separated.push_bind(r),
                        };
                    }
                    separated.push_unseparated(")");
                }
            }
        }
        Ok(())
    }
}

enum Bound {
    Text(String),
    Int(i64),
    Real(f64),
}

fn bind_value(value: &Value) -> Bound {
    match value {
        Value::String(s) => Bound::Text(s.clone()),
        Value::Bool(b) => Bound::Int(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Bound::Real(n.as_f64().unwrap_or_default()), Bound::Int),
        other => Bound::Text(other.to_string()),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match bind_value(value) {
        Bound::Text(s) => qb.push_bind(s),
        Bound::Int(i) => qb.push_bind(i),
        Bound::Real(r) => qb.push_bind(r),
    };
}

/// Row counts produced by one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub rows_written: u64,
    pub rows_deduplicated: u64,
    pub rows_deleted: u64,
}

impl WriteOutcome {
    pub fn absorb(&mut self, other: Self) {
        self.rows_written += other.rows_written;
        self.rows_deduplicated += other.rows_deduplicated;
        self.rows_deleted += other.rows_deleted;
    }
}

/// Everything `write_rows` needs to know about the destination.
pub(crate) struct TableWrite<'a> {
    pub table: &'a str,
    pub primary_key: &'a [String],
    pub strategy: WriteStrategy,
    pub workflow_id: &'a str,
    /// Documents a replace write owns even if no new rows mention them.
    pub replace_scope: &'a BTreeSet<String>,
}

struct PreparedRow {
    pk: String,
    document_id: Option<String>,
    workflow_id: String,
    row_hash: String,
    data: String,
}

/// Serializes with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                Value::Object(ordered.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

fn row_hash(row: &Row) -> String {
    let canonical = canonical_json(&Value::Object(row.clone()));
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn prepare_row(write: &TableWrite<'_>, row: Row) -> Result<PreparedRow> {
    let mut key = Vec::with_capacity(write.primary_key.len());
    for column in write.primary_key {
        match row.get(column) {
            Some(Value::Null) | None => {
                return Err(Error::SchemaViolation {
                    table: write.table.to_string(),
                    message: format!("primary key column {column} is empty"),
                });
            }
            Some(value) => key.push(value.clone()),
        }
    }

    let document_id = row.get(DOCUMENT_COLUMN).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    let workflow_id = row
        .get(WORKFLOW_COLUMN)
        .and_then(Value::as_str)
        .unwrap_or(write.workflow_id)
        .to_string();

    Ok(PreparedRow {
        pk: serde_json::to_string(&key)?,
        document_id,
        workflow_id,
        row_hash: row_hash(&row),
        data: serde_json::to_string(&row)?,
    })
}

impl Storage {
    /// Whether the physical table behind a logical table name exists yet.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        validate_identifier(table)?;
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(format!("tbl_{table}"))
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Runs a query. A table that was never written reads as empty.
    pub async fn query_rows(&self, query: &TableQuery) -> Result<Vec<Row>> {
        if !self.table_exists(query.table()).await? {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT data FROM ");
        qb.push(physical_name(query.table()));
        query.push_where(&mut qb)?;
        qb.push(" ORDER BY rowid");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(data,)| match serde_json::from_str::<Value>(&data)? {
                Value::Object(map) => Ok(map),
                other => Err(Error::corrupt(query.table(), format!("row is not an object: {other}"))),
            })
            .collect()
    }

    pub async fn count_rows(&self, query: &TableQuery) -> Result<u64> {
        if !self.table_exists(query.table()).await? {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
        qb.push(physical_name(query.table()));
        query.push_where(&mut qb)?;
        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;

        let count = u64::try_from(count).unwrap_or_default();
        Ok(query
            .limit
            .map_or(count, |limit| count.min(u64::try_from(limit).unwrap_or(u64::MAX))))
    }

    /// Writes a batch of rows in one transaction according to the write strategy.
    pub(crate) async fn write_rows(&self, write: &TableWrite<'_>, rows: Vec<Row>) -> Result<WriteOutcome> {
        validate_identifier(write.table)?;
        let mut outcome = WriteOutcome::default();

        // Collapse duplicate keys within the batch: first wins for append, last otherwise.
        let mut order: Vec<String> = Vec::new();
        let mut by_key: BTreeMap<String, PreparedRow> = BTreeMap::new();
        for row in rows {
            let prepared = prepare_row(write, row)?;
            if by_key.contains_key(&prepared.pk) {
                outcome.rows_deduplicated += 1;
                if write.strategy == WriteStrategy::Append {
                    continue;
                }
            } else {
                order.push(prepared.pk.clone());
            }
            by_key.insert(prepared.pk.clone(), prepared);
        }

        let table = physical_name(write.table);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                pk TEXT PRIMARY KEY,
                workflow_id TEXT,
                document_id TEXT,
                row_hash TEXT NOT NULL,
                data TEXT NOT NULL,
                written_at TEXT NOT NULL
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_tbl_{}_document\" ON {table}(document_id)",
            write.table
        ))
        .execute(&mut *tx)
        .await?;

        if write.strategy == WriteStrategy::Replace {
            let mut keep: BTreeMap<String, Vec<&str>> = write
                .replace_scope
                .iter()
                .map(|doc| (doc.clone(), Vec::new()))
                .collect();
            let mut undocumented: Vec<&str> = Vec::new();
            for row in by_key.values() {
                match &row.document_id {
                    Some(doc) => keep.entry(doc.clone()).or_default().push(&row.pk),
                    None => undocumented.push(&row.pk),
                }
            }

            if keep.is_empty() && !undocumented.is_empty() {
                // No document scope: the batch is the whole table.
                let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
                qb.push(&table);
                qb.push(" WHERE pk NOT IN (");
                let mut separated = qb.separated(", ");
                for pk in &undocumented {
                    separated.push_bind(*pk);
                }
                separated.push_unseparated(")");
                outcome.rows_deleted += qb.build().execute(&mut *tx).await?.rows_affected();
            }

            for (doc, pks) in &keep {
                let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
                qb.push(&table);
                qb.push(" WHERE document_id = ");
                qb.push_bind(doc.as_str());
                if !pks.is_empty() {
                    qb.push(" AND pk NOT IN (");
                    let mut separated = qb.separated(", ");
                    for pk in pks {
                        separated.push_bind(*pk);
                    }
                    separated.push_unseparated(")");
                }
                outcome.rows_deleted += qb.build().execute(&mut *tx).await?.rows_affected();
            }
        }

        let insert = match write.strategy {
            WriteStrategy::Append => format!(
                "INSERT INTO {table} (pk, workflow_id, document_id, row_hash, data, written_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(pk) DO NOTHING"
            ),
            WriteStrategy::Merge | WriteStrategy::Replace => format!(
                "INSERT INTO {table} (pk, workflow_id, document_id, row_hash, data, written_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(pk) DO UPDATE SET
                    workflow_id = excluded.workflow_id,
                    document_id = excluded.document_id,
                    row_hash = excluded.row_hash,
                    data = excluded.data,
                    written_at = excluded.written_at
                 WHERE {table}.row_hash <> excluded.row_hash"
            ),
        };

        let written_at = Utc::now().to_rfc3339();
        for pk in &order {
            let Some(row) = by_key.get(pk) else {
                continue;
            };
            let affected = sqlx::query(&insert)
                .bind(&row.pk)
                .bind(&row.workflow_id)
                .bind(&row.document_id)
                .bind(&row.row_hash)
                .bind(&row.data)
                .bind(&written_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if affected == 0 {
                outcome.rows_deduplicated += 1;
            } else {
                outcome.rows_written += 1;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            table = write.table,
            strategy = %write.strategy,
            written = outcome.rows_written,
            deduplicated = outcome.rows_deduplicated,
            deleted = outcome.rows_deleted,
            "Wrote rows"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn write<'a>(
        table: &'a str,
        primary_key: &'a [String],
        strategy: WriteStrategy,
        scope: &'a BTreeSet<String>,
    ) -> TableWrite<'a> {
        TableWrite {
            table,
            primary_key,
            strategy,
            workflow_id: "w1",
            replace_scope: scope,
        }
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty() {
        let storage = Storage::open_memory().await.unwrap();
        let rows = storage.query_rows(&TableQuery::new("table_x")).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(storage.count_rows(&TableQuery::new("table_x")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let storage = Storage::open_memory().await.unwrap();
        assert!(matches!(
            storage.query_rows(&TableQuery::new("x; DROP TABLE entities")).await,
            Err(Error::InvalidIdentifier(_))
        ));

        let pk = vec!["id".to_string()];
        let scope = BTreeSet::new();
        storage
            .write_rows(&write("items", &pk, WriteStrategy::Merge, &scope), vec![row(json!({"id": 1}))])
            .await
            .unwrap();
        let query = TableQuery::new("items").filter_eq("id') OR 1=1 --", 1);
        assert!(matches!(
            storage.query_rows(&query).await,
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let storage = Storage::open_memory().await.unwrap();
        let pk = vec!["id".to_string()];
        let scope = BTreeSet::new();
        let w = write("events", &pk, WriteStrategy::Append, &scope);

        let rows = vec![row(json!({"id": 1, "v": "a"})), row(json!({"id": 2, "v": "b"}))];
        let first = storage.write_rows(&w, rows.clone()).await.unwrap();
        assert_eq!(first.rows_written, 2);

        let second = storage.write_rows(&w, rows).await.unwrap();
        assert_eq!(second.rows_written, 0);
        assert_eq!(second.rows_deduplicated, 2);
        assert_eq!(storage.count_rows(&TableQuery::new("events")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_merge_updates_only_changed_rows() {
        let storage = Storage::open_memory().await.unwrap();
        let pk = vec!["id".to_string()];
        let scope = BTreeSet::new();
        let w = write("things", &pk, WriteStrategy::Merge, &scope);

        storage
            .write_rows(&w, vec![row(json!({"id": 1, "v": "a"})), row(json!({"id": 2, "v": "b"}))])
            .await
            .unwrap();
        let outcome = storage
            .write_rows(&w, vec![row(json!({"id": 1, "v": "a"})), row(json!({"id": 2, "v": "c"}))])
            .await
            .unwrap();
        assert_eq!(outcome.rows_written, 1);
        assert_eq!(outcome.rows_deduplicated, 1);

        let rows = storage
            .query_rows(&TableQuery::new("things").filter_eq("id", 2))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], "c");
    }

    #[tokio::test]
    async fn test_replace_drops_stale_rows_for_touched_documents_only() {
        let storage = Storage::open_memory().await.unwrap();
        let pk = vec!["document_id".to_string(), "n".to_string()];
        let scope = BTreeSet::new();
        let w = write("parts", &pk, WriteStrategy::Replace, &scope);

        storage
            .write_rows(
                &w,
                vec![
                    row(json!({"document_id": "a", "n": 1})),
                    row(json!({"document_id": "a", "n": 2})),
                    row(json!({"document_id": "b", "n": 1})),
                ],
            )
            .await
            .unwrap();

        let outcome = storage
            .write_rows(&w, vec![row(json!({"document_id": "a", "n": 1}))])
            .await
            .unwrap();
        assert_eq!(outcome.rows_deleted, 1);
        assert_eq!(outcome.rows_written, 0);
        assert_eq!(outcome.rows_deduplicated, 1);

        let a = storage
            .count_rows(&TableQuery::new("parts").filter_eq("document_id", "a"))
            .await
            .unwrap();
        let b = storage
            .count_rows(&TableQuery::new("parts").filter_eq("document_id", "b"))
            .await
            .unwrap();
        assert_eq!((a, b), (1, 1));

        let scope: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        let w = write("parts", &pk, WriteStrategy::Replace, &scope);
        let outcome = storage.write_rows(&w, Vec::new()).await.unwrap();
        assert_eq!(outcome.rows_deleted, 1);
    }

    #[tokio::test]
    async fn test_filters() {
        let storage = Storage::open_memory().await.unwrap();
        let pk = vec!["id".to_string()];
        let scope = BTreeSet::new();
        let w = write("people", &pk, WriteStrategy::Merge, &scope);
        storage
            .write_rows(
                &w,
                vec![
                    row(json!({"id": 1, "name": "Ada", "active": true})),
                    row(json!({"id": 2, "name": "Grace", "active": false})),
                    row(json!({"id": 3, "name": "Linus", "active": true})),
                ],
            )
            .await
            .unwrap();

        let active = storage
            .query_rows(&TableQuery::new("people").filter_eq("active", true))
            .await
            .unwrap();
        assert_eq!(active.len(), 2);

        let named = storage
            .query_rows(&TableQuery::new("people").filter_in("name", ["Ada", "Grace"]).limit(1))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0]["name"], "Ada");

        let none = storage
            .query_rows(&TableQuery::new("people").filter_in("name", Vec::<String>::new()))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
