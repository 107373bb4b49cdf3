use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::similarity::cosine_similarity;
use crate::entity::EntityType;
use crate::storage::Storage;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Only entities whose type is compatible with this one.
    pub entity_type: Option<EntityType>,
    pub exclude: Vec<Uuid>,
}

impl SearchFilter {
    #[must_use]
    pub fn compatible_with(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            exclude: Vec::new(),
        }
    }

    fn admits(&self, id: Uuid, entity_type: EntityType) -> bool {
        !self.exclude.contains(&id)
            && self
                .entity_type
                .is_none_or(|wanted| wanted.is_compatible_with(&entity_type))
    }
}

/// Similarity search over canonical entity embeddings.
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` entity ids with their similarity score, best first.
    async fn search_similar(&self, embedding: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<(Uuid, f32)>>;

    async fn upsert(&self, entity_id: Uuid, entity_type: EntityType, embedding: Vec<f32>) -> Result<()>;
}

/// Brute-force cosine index kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<Uuid, (EntityType, Vec<f32>)>>,
}

impl InMemoryVectorIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every stored entity that carries an embedding. Returns how many were indexed.
    pub async fn warm_from(&self, storage: &Storage) -> Result<usize> {
        let entities = storage.list_entities().await?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        for entity in entities {
            if let Some(embedding) = entity.embedding {
                entries.insert(entity.id, (entity.entity_type, embedding));
            }
        }
        let loaded = entries.len() - before;
        tracing::debug!("Vector index warmed with {} entities", loaded);
        Ok(loaded)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search_similar(&self, embedding: &[f32], k: usize, filter: &SearchFilter) -> Result<Vec<(Uuid, f32)>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(Uuid, f32)> = entries
            .iter()
            .filter(|(id, (entity_type, _))| filter.admits(**id, *entity_type))
            .map(|(id, (_, vector))| (*id, cosine_similarity(embedding, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert(&self, entity_id: Uuid, entity_type: EntityType, embedding: Vec<f32>) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(entity_id, (entity_type, embedding));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[tokio::test]
    async fn test_search_orders_and_filters() {
        let index = InMemoryVectorIndex::new();
        let close = Uuid::now_v7();
        let far = Uuid::now_v7();
        let other_type = Uuid::now_v7();
        index.upsert(close, EntityType::Person, vec![1.0, 0.1]).await.unwrap();
        index.upsert(far, EntityType::Person, vec![0.0, 1.0]).await.unwrap();
        index
            .upsert(other_type, EntityType::Location, vec![1.0, 0.0])
            .await
            .unwrap();

        let hits = index
            .search_similar(&[1.0, 0.0], 5, &SearchFilter::compatible_with(EntityType::Person))
            .await
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![close, far]);

        let top = index.search_similar(&[1.0, 0.0], 1, &SearchFilter::default()).await.unwrap();
        assert_eq!(top[0].0, other_type);
    }

    #[tokio::test]
    async fn test_warm_from_storage() {
        let storage = Storage::open_memory().await.unwrap();
        let with = Entity::new("Ada".to_string(), EntityType::Person).with_embedding(vec![1.0, 0.0]);
        let without = Entity::new("Bob".to_string(), EntityType::Person);
        storage.insert_entity(&with).await.unwrap();
        storage.insert_entity(&without).await.unwrap();

        let index = InMemoryVectorIndex::new();
        assert_eq!(index.warm_from(&storage).await.unwrap(), 1);
        assert_eq!(index.len().await, 1);
    }
}
