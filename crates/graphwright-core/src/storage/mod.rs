mod checkpoint;
mod documents;
mod graph;
mod table;

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::Result;

pub use table::{TableQuery, WriteOutcome, WriteStrategy};
pub(crate) use table::{validate_identifier, TableWrite};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    description TEXT,
    embedding TEXT,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_normalized ON entities(normalized_name);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

CREATE TABLE IF NOT EXISTS entity_aliases (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    normalized_alias TEXT NOT NULL,
    PRIMARY KEY (entity_id, normalized_alias)
);

CREATE INDEX IF NOT EXISTS idx_aliases_normalized ON entity_aliases(normalized_alias);

CREATE TABLE IF NOT EXISTS document_entities (
    document_id TEXT NOT NULL,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    workflow_id TEXT NOT NULL,
    PRIMARY KEY (document_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_document_entities_entity ON document_entities(entity_id);

CREATE TABLE IF NOT EXISTS entity_relationships (
    id TEXT PRIMARY KEY,
    source_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    context TEXT,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_rel_unique
    ON entity_relationships(source_entity_id, target_entity_id, relationship_type);
CREATE INDEX IF NOT EXISTS idx_rel_target ON entity_relationships(target_entity_id);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    statement TEXT NOT NULL,
    normalized_statement TEXT NOT NULL,
    claim_type TEXT NOT NULL,
    signature TEXT NOT NULL UNIQUE,
    entity_ids TEXT NOT NULL,
    attribute TEXT,
    value TEXT,
    confidence REAL NOT NULL,
    evidence TEXT NOT NULL,
    conflicts_with TEXT REFERENCES claims(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claim_entities (
    claim_id TEXT NOT NULL REFERENCES claims(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (claim_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_claim_entities_entity ON claim_entities(entity_id);

CREATE TABLE IF NOT EXISTS pipeline_steps (
    workflow_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    result TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (workflow_id, stage)
);
"#;

/// Handle to the SQLite store. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
