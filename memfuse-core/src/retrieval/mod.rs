//! Hybrid retrieval: vector similarity fused with structured/keyword lookup
//! across chunks, facts, and workflows (spec §4.2).

mod keywords;

pub use keywords::extract_keywords;

use crate::config::MemFuseConfig;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::storage::StorageBackend;
use crate::types::content_hash;
use std::sync::Arc;
use uuid::Uuid;

/// What kind of memory a [`RecalledItem`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallKind {
    Chunk,
    Fact,
    Workflow,
}

/// One fused, ranked recall hit.
#[derive(Debug, Clone)]
pub struct RecalledItem {
    pub kind: RecallKind,
    pub content: String,
    pub score: f32,
    pub origin: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Recall configuration for a single retrieval call.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub session_id: Option<Uuid>,
    pub top_k: usize,
    pub include_chunks: bool,
    pub include_facts: bool,
    pub include_workflows: bool,
}

impl RetrieveRequest {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            top_k: 5,
            include_chunks: true,
            include_facts: true,
            include_workflows: false,
        }
    }
}

/// Fuses vector similarity with structured/keyword lookup across the store.
pub struct Retriever<E, S> {
    embedder: Arc<E>,
    storage: Arc<S>,
    config: MemFuseConfig,
}

impl<E: Embedder, S: StorageBackend> Retriever<E, S> {
    pub fn new(embedder: Arc<E>, storage: Arc<S>, config: MemFuseConfig) -> Self {
        Self { embedder, storage, config }
    }

    /// Run the fused-recall algorithm described in spec §4.2.
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<Vec<RecalledItem>> {
        let query_embedding = self.embedder.embed(&request.query).await?;
        let mut streams: Vec<RecalledItem> = Vec::new();

        if request.include_chunks {
            streams.extend(self.recall_chunks(request, &query_embedding).await?);
        }

        if request.include_facts && self.config.structured_enabled {
            streams.extend(self.recall_facts(request, &query_embedding).await?);
        }

        if request.include_workflows {
            streams.extend(self.recall_workflows(request, &query_embedding).await?);
        }

        Ok(fuse(streams, request.top_k))
    }

    async fn recall_chunks(
        &self,
        request: &RetrieveRequest,
        query_embedding: &[f32],
    ) -> Result<Vec<RecalledItem>> {
        let scoped_source = if self.config.retrieval_prefer_session {
            request.session_id.map(|id| id.to_string())
        } else {
            None
        };

        let mut hits = self
            .storage
            .search_chunks(
                query_embedding,
                self.config.rag_top_k,
                scoped_source.as_deref(),
                false,
            )
            .await?;

        // Sequential fallback: an approximate index can return zero rows on
        // a small corpus even when matches exist (spec §4.2 step 6, §9).
        if hits.is_empty() {
            hits = self
                .storage
                .search_chunks(query_embedding, self.config.rag_top_k, scoped_source.as_deref(), true)
                .await?;
        }

        Ok(hits
            .into_iter()
            .map(|hit| RecalledItem {
                kind: RecallKind::Chunk,
                content: hit.item.content,
                score: hit.score,
                origin: hit.item.chunk_id,
                created_at: chrono::Utc::now(),
            })
            .collect())
    }

    async fn recall_facts(
        &self,
        request: &RetrieveRequest,
        query_embedding: &[f32],
    ) -> Result<Vec<RecalledItem>> {
        let vector_hits = self
            .storage
            .search_facts(query_embedding, self.config.structured_top_k, request.session_id, None)
            .await?;

        let tokens = extract_keywords(&request.query);
        let keyword_hits = if tokens.is_empty() {
            Vec::new()
        } else {
            self.storage
                .keyword_search_facts(&tokens, self.config.structured_top_k, request.session_id)
                .await?
        };

        let mut merged: std::collections::HashMap<Uuid, RecalledItem> = std::collections::HashMap::new();
        for hit in vector_hits {
            merged.insert(
                hit.item.fact_id,
                RecalledItem {
                    kind: RecallKind::Fact,
                    content: hit.item.content,
                    score: hit.score,
                    origin: hit.item.fact_id,
                    created_at: hit.item.created_at,
                },
            );
        }
        for hit in keyword_hits {
            let fused_score = self.config.keyword_fusion_alpha * hit.score;
            merged
                .entry(hit.item.fact_id)
                .and_modify(|existing| existing.score = existing.score.max(fused_score))
                .or_insert(RecalledItem {
                    kind: RecallKind::Fact,
                    content: hit.item.content,
                    score: fused_score,
                    origin: hit.item.fact_id,
                    created_at: hit.item.created_at,
                });
        }

        Ok(merged.into_values().collect())
    }

    async fn recall_workflows(
        &self,
        request: &RetrieveRequest,
        query_embedding: &[f32],
    ) -> Result<Vec<RecalledItem>> {
        let hits = self
            .storage
            .search_workflows(query_embedding, self.config.procedural_top_k)
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| RecalledItem {
                kind: RecallKind::Workflow,
                content: describe_workflow(&hit.item),
                score: hit.score,
                origin: hit.item.workflow_id,
                created_at: hit.item.updated_at,
            })
            .collect())
    }
}

fn describe_workflow(workflow: &crate::types::Workflow) -> String {
    let steps: Vec<&str> = workflow.successful_workflow.iter().map(|step| step.agent.as_str()).collect();
    format!("workflow[{}]: {}", workflow.usage_count, steps.join(" -> "))
}

/// Interleave streams in descending score order, dedup on content hash, tie
/// broken by recency, capped by `top_k`.
fn fuse(mut items: Vec<RecalledItem>, top_k: usize) -> Vec<RecalledItem> {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let mut seen = std::collections::HashSet::new();
    let mut fused = Vec::with_capacity(top_k.min(items.len()));
    for item in items {
        let hash = content_hash(&item.content);
        if seen.insert(hash) {
            fused.push(item);
            if fused.len() >= top_k {
                break;
            }
        }
    }
    fused
}

/// Boosts workflow-kind recall results by a fixed weight — used when a
/// request carries `tag=m3` to promote procedural recall to the head (spec
/// §4.5).
#[must_use]
pub fn bias_toward_workflows(mut items: Vec<RecalledItem>, weight: f32) -> Vec<RecalledItem> {
    for item in &mut items {
        if item.kind == RecallKind::Workflow {
            item.score *= weight;
        }
    }
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: RecallKind, content: &str, score: f32) -> RecalledItem {
        RecalledItem {
            kind,
            content: content.to_string(),
            score,
            origin: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn fuse_dedups_by_content_hash_keeping_higher_score() {
        let items = vec![
            item(RecallKind::Chunk, "same text", 0.4),
            item(RecallKind::Chunk, "same text", 0.9),
            item(RecallKind::Chunk, "different", 0.5),
        ];
        let fused = fuse(items, 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].content, "same text");
        assert_eq!(fused[0].score, 0.9);
    }

    #[test]
    fn fuse_respects_top_k_cap() {
        let items = (0..10).map(|i| item(RecallKind::Chunk, &format!("text {i}"), i as f32)).collect();
        let fused = fuse(items, 3);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].content, "text 9");
    }

    #[test]
    fn bias_toward_workflows_promotes_them() {
        let items = vec![item(RecallKind::Chunk, "c", 0.8), item(RecallKind::Workflow, "w", 0.7)];
        let biased = bias_toward_workflows(items, 1.25);
        assert_eq!(biased[0].kind, RecallKind::Workflow);
    }
}
