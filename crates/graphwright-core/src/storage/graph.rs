use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Storage;
use crate::{
    claim::{Claim, ClaimEvidence},
    entity::{normalize_name, DocumentEntity, Entity, EntityType},
    relationship::EntityRelationship,
    Error, Result,
};

type EntityRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    f64,
    String,
    String,
);

type RelationshipRow = (String, String, String, String, Option<String>, f64, String);

type ClaimRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    f64,
    String,
    Option<String>,
    String,
    String,
);

const ENTITY_COLUMNS: &str =
    "e.id, e.name, e.entity_type, e.description, e.embedding, e.confidence, e.created_at, e.updated_at";

const CLAIM_COLUMNS: &str = "c.id, c.statement, c.claim_type, c.signature, c.entity_ids, c.attribute, \
     c.value, c.confidence, c.evidence, c.conflicts_with, c.created_at, c.updated_at";

impl Storage {
    // Entity operations

    pub async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let embedding = entity.embedding.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO entities (id, name, normalized_name, entity_type, description, embedding, confidence, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entity.id.to_string())
        .bind(&entity.name)
        .bind(entity.normalized_name())
        .bind(entity.entity_type.as_str())
        .bind(&entity.description)
        .bind(embedding)
        .bind(entity.confidence)
        .bind(entity.created_at.to_rfc3339())
        .bind(entity.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        for alias in &entity.aliases {
            self.insert_alias(entity.id, alias).await?;
        }

        Ok(())
    }

    /// Rewrites the mutable fields of an entity and adds any new aliases.
    pub async fn update_entity(&self, entity: &Entity) -> Result<()> {
        let embedding = entity.embedding.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE entities
            SET name = ?, normalized_name = ?, entity_type = ?, description = ?, embedding = ?, confidence = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&entity.name)
        .bind(entity.normalized_name())
        .bind(entity.entity_type.as_str())
        .bind(&entity.description)
        .bind(embedding)
        .bind(entity.confidence)
        .bind(Utc::now().to_rfc3339())
        .bind(entity.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::EntityNotFound(entity.id));
        }

        for alias in &entity.aliases {
            self.insert_alias(entity.id, alias).await?;
        }

        Ok(())
    }

    pub async fn find_entity(&self, id: Uuid) -> Result<Option<Entity>> {
        let row: Option<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e WHERE e.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_entity(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_entity(&self, id: Uuid) -> Result<Entity> {
        self.find_entity(id).await?.ok_or(Error::EntityNotFound(id))
    }

    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e ORDER BY e.created_at, e.id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(self.hydrate_entity(row).await?);
        }
        Ok(entities)
    }

    /// Entities whose name or any alias normalizes to `name`.
    pub async fn find_entities_by_name(&self, name: &str) -> Result<Vec<Entity>> {
        let normalized = normalize_name(name);
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            r#"
            SELECT DISTINCT {ENTITY_COLUMNS}
            FROM entities e
            LEFT JOIN entity_aliases a ON a.entity_id = e.id
            WHERE e.normalized_name = ? OR a.normalized_alias = ?
            ORDER BY e.created_at, e.id
            "#
        ))
        .bind(&normalized)
        .bind(&normalized)
        .fetch_all(&self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(self.hydrate_entity(row).await?);
        }
        Ok(entities)
    }

    pub async fn count_entities(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM entities").await
    }

    // Alias operations

    /// Returns false when the entity already answers to this alias.
    pub async fn insert_alias(&self, entity_id: Uuid, alias: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_aliases (entity_id, alias, normalized_alias)
            VALUES (?, ?, ?)
            ON CONFLICT(entity_id, normalized_alias) DO NOTHING
            "#,
        )
        .bind(entity_id.to_string())
        .bind(alias)
        .bind(normalize_name(alias))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_aliases(&self, entity_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT alias FROM entity_aliases WHERE entity_id = ? ORDER BY rowid")
                .bind(entity_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(alias,)| alias).collect())
    }

    // Document links

    /// Returns false when the document was already linked to the entity.
    pub async fn link_document_entity(&self, link: &DocumentEntity) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_entities (document_id, entity_id, workflow_id)
            VALUES (?, ?, ?)
            ON CONFLICT(document_id, entity_id) DO NOTHING
            "#,
        )
        .bind(&link.document_id)
        .bind(link.entity_id.to_string())
        .bind(&link.workflow_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn document_entities(&self, document_id: &str) -> Result<Vec<DocumentEntity>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT document_id, entity_id, workflow_id FROM document_entities WHERE document_id = ? ORDER BY rowid",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(document_id, entity_id, workflow_id)| {
                Ok(DocumentEntity {
                    document_id,
                    entity_id: parse_uuid("document_entities", &entity_id)?,
                    workflow_id,
                })
            })
            .collect()
    }

    pub async fn count_document_entities(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM document_entities").await
    }

    // Relationship operations

    /// Inserts a relationship or raises the confidence of the existing one with the
    /// same endpoints and type. Returns true when a new row was created.
    pub async fn upsert_relationship(&self, rel: &EntityRelationship) -> Result<bool> {
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM entity_relationships
            WHERE source_entity_id = ? AND target_entity_id = ? AND relationship_type = ?
            "#,
        )
        .bind(rel.source_entity_id.to_string())
        .bind(rel.target_entity_id.to_string())
        .bind(&rel.relationship_type)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = existing {
            sqlx::query(
                r#"
                UPDATE entity_relationships
                SET confidence = MAX(confidence, ?), context = COALESCE(context, ?)
                WHERE id = ?
                "#,
            )
            .bind(rel.confidence)
            .bind(&rel.context)
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO entity_relationships (id, source_entity_id, target_entity_id, relationship_type, context, confidence, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rel.id.to_string())
        .bind(rel.source_entity_id.to_string())
        .bind(rel.target_entity_id.to_string())
        .bind(&rel.relationship_type)
        .bind(&rel.context)
        .bind(rel.confidence)
        .bind(rel.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn get_entity_relationships(&self, entity_id: Uuid) -> Result<Vec<EntityRelationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            r#"
            SELECT id, source_entity_id, target_entity_id, relationship_type, context, confidence, created_at
            FROM entity_relationships
            WHERE source_entity_id = ? OR target_entity_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(entity_id.to_string())
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_relationship_row).collect()
    }

    pub async fn count_relationships(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM entity_relationships").await
    }

    // Claim operations

    pub async fn insert_claim(&self, claim: &Claim) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO claims (id, statement, normalized_statement, claim_type, signature, entity_ids,
                                attribute, value, confidence, evidence, conflicts_with, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(claim.id.to_string())
        .bind(&claim.statement)
        .bind(&claim.normalized_statement)
        .bind(&claim.claim_type)
        .bind(&claim.signature)
        .bind(serde_json::to_string(&claim.entity_ids)?)
        .bind(&claim.attribute)
        .bind(&claim.value)
        .bind(claim.confidence)
        .bind(serde_json::to_string(&claim.evidence)?)
        .bind(claim.conflicts_with.map(|id| id.to_string()))
        .bind(claim.created_at.to_rfc3339())
        .bind(claim.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        for entity_id in &claim.entity_ids {
            sqlx::query(
                "INSERT INTO claim_entities (claim_id, entity_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(claim.id.to_string())
            .bind(entity_id.to_string())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Persists merged confidence and evidence. The conflict pointer is left alone.
    pub async fn update_claim_evidence(&self, claim: &Claim) -> Result<()> {
        let result = sqlx::query(
            "UPDATE claims SET confidence = ?, evidence = ?, updated_at = ? WHERE id = ?",
        )
        .bind(claim.confidence)
        .bind(serde_json::to_string(&claim.evidence)?)
        .bind(Utc::now().to_rfc3339())
        .bind(claim.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ClaimNotFound(claim.id));
        }

        Ok(())
    }

    /// Points `claim_id` at `conflicting_id` unless it already points somewhere.
    pub async fn set_conflict_if_unset(&self, claim_id: Uuid, conflicting_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE claims SET conflicts_with = ?, updated_at = ? WHERE id = ? AND conflicts_with IS NULL",
        )
        .bind(conflicting_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(claim_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_claim(&self, id: Uuid) -> Result<Option<Claim>> {
        let row: Option<ClaimRow> =
            sqlx::query_as(&format!("SELECT {CLAIM_COLUMNS} FROM claims c WHERE c.id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(parse_claim_row).transpose()
    }

    pub async fn get_claim(&self, id: Uuid) -> Result<Claim> {
        self.find_claim(id).await?.ok_or(Error::ClaimNotFound(id))
    }

    pub async fn find_claim_by_signature(&self, signature: &str) -> Result<Option<Claim>> {
        let row: Option<ClaimRow> = sqlx::query_as(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims c WHERE c.signature = ?"
        ))
        .bind(signature)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_claim_row).transpose()
    }

    pub async fn claims_for_entity(&self, entity_id: Uuid) -> Result<Vec<Claim>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CLAIM_COLUMNS}
            FROM claims c
            JOIN claim_entities ce ON ce.claim_id = c.id
            WHERE ce.entity_id = ?
            ORDER BY c.created_at, c.id
            "#
        ))
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_claim_row).collect()
    }

    pub async fn list_claims(&self) -> Result<Vec<Claim>> {
        let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
            "SELECT {CLAIM_COLUMNS} FROM claims c ORDER BY c.created_at, c.id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_claim_row).collect()
    }

    pub async fn count_claims(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM claims").await
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(sql).fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn hydrate_entity(&self, row: EntityRow) -> Result<Entity> {
        let mut entity = parse_entity_row(row)?;
        entity.aliases = self.get_aliases(entity.id).await?;
        Ok(entity)
    }
}

fn parse_uuid(table: &str, raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| Error::corrupt(table, format!("invalid id {raw:?}")))
}

fn parse_timestamp(table: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::corrupt(table, format!("invalid timestamp {raw:?}")))
}

fn parse_entity_row(row: EntityRow) -> Result<Entity> {
    let (id, name, entity_type, description, embedding, confidence, created_at, updated_at) = row;

    Ok(Entity {
        id: parse_uuid("entities", &id)?,
        name,
        entity_type: EntityType::parse_lenient(&entity_type),
        description,
        aliases: Vec::new(),
        embedding: embedding.map(|e| serde_json::from_str(&e)).transpose()?,
        confidence,
        created_at: parse_timestamp("entities", &created_at)?,
        updated_at: parse_timestamp("entities", &updated_at)?,
    })
}

fn parse_relationship_row(row: RelationshipRow) -> Result<EntityRelationship> {
    let (id, source, target, relationship_type, context, confidence, created_at) = row;

    Ok(EntityRelationship {
        id: parse_uuid("entity_relationships", &id)?,
        source_entity_id: parse_uuid("entity_relationships", &source)?,
        target_entity_id: parse_uuid("entity_relationships", &target)?,
        relationship_type,
        context,
        confidence,
        created_at: parse_timestamp("entity_relationships", &created_at)?,
    })
}

fn parse_claim_row(row: ClaimRow) -> Result<Claim> {
    let (
        id,
        statement,
        claim_type,
        signature,
        entity_ids,
        attribute,
        value,
        confidence,
        evidence,
        conflicts_with,
        created_at,
        updated_at,
    ) = row;

    let evidence: Vec<ClaimEvidence> = serde_json::from_str(&evidence)?;

    Ok(Claim {
        id: parse_uuid("claims", &id)?,
        normalized_statement: crate::claim::normalize_statement(&statement),
        statement,
        claim_type,
        signature,
        entity_ids: serde_json::from_str(&entity_ids)?,
        attribute,
        value,
        confidence,
        evidence,
        conflicts_with: conflicts_with
            .map(|raw| parse_uuid("claims", &raw))
            .transpose()?,
        created_at: parse_timestamp("claims", &created_at)?,
        updated_at: parse_timestamp("claims", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_crud_and_alias_lookup() {
        let storage = Storage::open_memory().await.unwrap();

        let entity = Entity::new("Python".to_string(), EntityType::Technology)
            .with_aliases(["CPython"])
            .with_embedding(vec![0.5, 0.5])
            .with_confidence(0.8);
        storage.insert_entity(&entity).await.unwrap();

        let fetched = storage.get_entity(entity.id).await.unwrap();
        assert_eq!(fetched.name, "Python");
        assert_eq!(fetched.aliases, vec!["CPython".to_string()]);
        assert_eq!(fetched.embedding, Some(vec![0.5, 0.5]));

        let by_alias = storage.find_entities_by_name("  cpython ").await.unwrap();
        assert_eq!(by_alias.len(), 1);
        assert_eq!(by_alias[0].id, entity.id);

        let mut updated = fetched;
        updated.add_alias("Python language".to_string());
        updated.description = Some("A language".to_string());
        storage.update_entity(&updated).await.unwrap();
        assert_eq!(storage.find_entities_by_name("python language").await.unwrap().len(), 1);
        assert!(!storage.insert_alias(entity.id, "python LANGUAGE").await.unwrap());

        assert!(storage.find_entity(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relationship_upsert_keeps_max_confidence() {
        let storage = Storage::open_memory().await.unwrap();
        let a = Entity::new("A".to_string(), EntityType::Person);
        let b = Entity::new("B".to_string(), EntityType::Person);
        storage.insert_entity(&a).await.unwrap();
        storage.insert_entity(&b).await.unwrap();

        let rel = EntityRelationship::new(a.id, b.id, "knows")
            .unwrap()
            .with_confidence(0.4);
        assert!(storage.upsert_relationship(&rel).await.unwrap());

        let again = EntityRelationship::new(a.id, b.id, "Knows")
            .unwrap()
            .with_confidence(0.9);
        assert!(!storage.upsert_relationship(&again).await.unwrap());

        let rels = storage.get_entity_relationships(b.id).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert!((rels[0].confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_conflict_pointer_only_set_once() {
        let storage = Storage::open_memory().await.unwrap();
        let first = Claim::new("x is 1".to_string(), "fact".to_string(), vec![]);
        let second = Claim::new("x is 2".to_string(), "fact".to_string(), vec![]);
        let third = Claim::new("x is 3".to_string(), "fact".to_string(), vec![]);
        for claim in [&first, &second, &third] {
            storage.insert_claim(claim).await.unwrap();
        }

        assert!(storage.set_conflict_if_unset(first.id, second.id).await.unwrap());
        assert!(!storage.set_conflict_if_unset(first.id, third.id).await.unwrap());
        assert_eq!(
            storage.get_claim(first.id).await.unwrap().conflicts_with,
            Some(second.id)
        );
    }
}
