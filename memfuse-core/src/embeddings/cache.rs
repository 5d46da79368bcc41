//! In-process embedding cache: concurrent readers, single writer per key
//! with coalescing — at most one embed call in flight per content hash
//! (spec §5, "Shared-resource policy").

use super::Embedder;
use crate::error::Result;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Wraps an [`Embedder`] with an LRU cache keyed by content hash. Concurrent
/// calls for the same text share one in-flight embed call instead of each
/// issuing their own request to the external service.
pub struct EmbeddingCache<E> {
    embedder: Arc<E>,
    entries: AsyncMutex<LruCache<String, Vec<f32>>>,
    in_flight: AsyncMutex<HashMap<String, Arc<tokio::sync::Notify>>>,
}

impl<E: Embedder> EmbeddingCache<E> {
    #[must_use]
    pub fn new(embedder: Arc<E>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            embedder,
            entries: AsyncMutex::new(LruCache::new(capacity)),
            in_flight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Fetch the embedding for `text`, serving from cache when present and
    /// coalescing concurrent misses for the same content hash into a single
    /// upstream call.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.embedder.content_hash(text);

        if let Some(cached) = self.entries.lock().await.get(&key).cloned() {
            return Ok(cached);
        }

        loop {
            let notify = {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(notify) = in_flight.get(&key) {
                    Some(Arc::clone(notify))
                } else {
                    in_flight.insert(key.clone(), Arc::new(tokio::sync::Notify::new()));
                    None
                }
            };

            let Some(notify) = notify else {
                // We're the coalescing leader for this key.
                let result = self.embedder.embed(text).await;
                if let Ok(ref embedding) = result {
                    self.entries.lock().await.put(key.clone(), embedding.clone());
                }
                let notify = self.in_flight.lock().await.remove(&key);
                if let Some(notify) = notify {
                    notify.notify_waiters();
                }
                return result;
            };

            // Another caller owns the in-flight request; wait for it, then
            // retry the cache lookup.
            notify.notified().await;
            if let Some(cached) = self.entries.lock().await.get(&key).cloned() {
                return Ok(cached);
            }
        }
    }

    #[must_use]
    pub fn embedder(&self) -> &E {
        self.embedder.as_ref()
    }
}

/// The cache is itself an [`Embedder`] so it can be dropped in wherever a
/// raw provider was expected, putting the coalescing cache on the hot path
/// for every caller (spec §5) instead of requiring each call site to know
/// about it.
#[async_trait::async_trait]
impl<E: Embedder> Embedder for EmbeddingCache<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        EmbeddingCache::embed(self, text).await
    }

    fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    fn content_hash(&self, text: &str) -> String {
        self.embedder.content_hash(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;

    #[tokio::test]
    async fn repeated_lookups_hit_cache() {
        let cache = EmbeddingCache::new(Arc::new(MockEmbedder::new(8)), 16);
        let a = cache.embed("hello").await.unwrap();
        let b = cache.embed("hello").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn concurrent_lookups_for_same_key_coalesce() {
        let cache = Arc::new(EmbeddingCache::new(Arc::new(MockEmbedder::new(8)), 16));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.embed("same text").await.unwrap() }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        for pair in results.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
