use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::similarity::normalize_l2;
use crate::entity::normalize_name;
use crate::Result;

/// Text-to-vector capability used to cluster entity mentions.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Feature-hashing embedder for offline runs and tests.
///
/// Words and padded character trigrams of the normalised text are hashed into
/// a fixed number of buckets and the result is L2 normalised. Surface variants
/// of a name land close together; unrelated names mostly do not.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    #[must_use]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized = normalize_name(text);
        let mut vector = vec![0.0_f32; self.dimensions];

        for word in normalized.split(' ').filter(|w| !w.is_empty()) {
            vector[self.bucket(("w", word))] += 1.0;
        }

        let padded: Vec<char> = format!(" {normalized} ").chars().collect();
        for gram in padded.windows(3) {
            vector[self.bucket(("t", gram))] += 1.0;
        }

        normalize_l2(&vector)
    }

    fn bucket<T: Hash>(&self, feature: T) -> usize {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let buckets = u64::try_from(self.dimensions).unwrap_or(u64::MAX);
        usize::try_from(hasher.finish() % buckets).unwrap_or_default()
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::similarity::cosine_similarity;

    #[tokio::test]
    async fn test_hashing_embedder_is_stable() {
        let embedder = HashingEmbedder::default();
        let vectors = embedder
            .embed(&["Acme Corp".to_string(), "acme   corp".to_string(), "Zebra".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0].len(), HashingEmbedder::DEFAULT_DIMENSIONS);
        assert!((cosine_similarity(&vectors[0], &vectors[1]) - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&vectors[0], &vectors[2]) < 0.5);
    }
}
