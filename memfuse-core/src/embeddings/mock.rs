//! Deterministic mock embedder used by tests and examples in place of a
//! real embedding service.

use super::Embedder;
use crate::error::Result;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Produces a unit-normalized pseudo-random vector seeded from the input
/// text's hash, so the same text always yields the same embedding and
/// distinct texts yield (with overwhelming probability) distinct ones.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(crate::types::EMBEDDING_DIM)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let seed = seed_from_text(text);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|_| rng.random::<f32>() * 2.0 - 1.0)
            .collect();

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for component in &mut vector {
                *component /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn seed_from_text(text: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embeddings_are_unit_normalized() {
        let embedder = MockEmbedder::new(16);
        let v = embedder.embed("some text").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
