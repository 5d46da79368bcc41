//! Embedder contract and the in-process embedding cache.
//!
//! The Embedder is injected (spec §1, §6): it wraps an external
//! text-to-vector service and is consumed as `embed(text) -> vector`. This
//! module defines that contract plus a deterministic mock used across the
//! test suite, and the single-writer-per-key LRU cache from the concurrency
//! model (spec §5).

mod cache;
mod mock;
mod similarity;

pub use cache::EmbeddingCache;
pub use mock::MockEmbedder;
pub use similarity::cosine_similarity;

use crate::error::Result;
use crate::types::content_hash;
use async_trait::async_trait;

/// Trait for text-to-vector providers. Implementations call out to an
/// external embedding service; a missing embedding on insert is a failure,
/// never silently skipped (spec §3).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate the fixed-width embedding for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Fixed dimension this provider returns (spec: `embedding_dim`, 1024).
    fn dimension(&self) -> usize;

    /// Deterministic content hash, used for chunk/recall dedup. Computed
    /// independently of the embedding call so it's available even when the
    /// embedder is down.
    fn content_hash(&self, text: &str) -> String {
        content_hash(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(1024);
        let a = embedder.embed("hello world").await.unwrap();
        let b = embedder.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1024);
    }

    #[tokio::test]
    async fn mock_embedder_differs_by_text() {
        let embedder = MockEmbedder::new(1024);
        let a = embedder.embed("alpha").await.unwrap();
        let b = embedder.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }
}
