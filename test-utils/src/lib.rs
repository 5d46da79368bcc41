//! Shared test fixtures and an in-memory [`StorageBackend`] double for
//! exercising the Context Controller, Retriever, Extractor, Orchestrator,
//! and Router without a real libsql database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memfuse_core::embeddings::cosine_similarity;
use memfuse_core::error::Result;
use memfuse_core::storage::{ScoredMatch, StorageBackend};
use memfuse_core::types::{
    Chunk, Fact, FactRelations, FactType, Lesson, Speaker, Turn, Workflow,
};
use parking_lot::Mutex;
use uuid::Uuid;

/// A deterministic pseudo-embedding: stable across calls with the same
/// text, useful for asserting dedup/similarity behavior without a real
/// embedder.
#[must_use]
pub fn fixture_embedding(seed: u64, dim: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..dim)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}

#[must_use]
pub fn test_turn(session_id: Uuid, round_id: i64, speaker: Speaker, content: &str) -> Turn {
    Turn { session_id, round_id, speaker, content: content.to_string(), timestamp: Utc::now() }
}

#[must_use]
pub fn test_chunk(document_source: &str, content: &str, dim: usize) -> Chunk {
    Chunk {
        chunk_id: Uuid::new_v4(),
        document_source: document_source.to_string(),
        content: content.to_string(),
        embedding: fixture_embedding(content.len() as u64, dim),
        content_hash: memfuse_core::types::content_hash(content),
    }
}

#[must_use]
pub fn test_fact(session_id: Uuid, round_id: i64, fact_type: FactType, content: &str, dim: usize) -> Fact {
    Fact {
        fact_id: Uuid::new_v4(),
        session_id,
        source_round_id: round_id,
        fact_type,
        content: content.to_string(),
        relations: FactRelations::default(),
        metadata: std::collections::HashMap::new(),
        embedding: fixture_embedding(content.len() as u64, dim),
        created_at: Utc::now(),
    }
}

#[must_use]
pub fn test_workflow(trigger_pattern: Option<&str>, dim: usize) -> Workflow {
    Workflow {
        workflow_id: Uuid::new_v4(),
        trigger_embedding: fixture_embedding(7, dim),
        trigger_pattern: trigger_pattern.map(str::to_string),
        successful_workflow: Vec::new(),
        usage_count: 1,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// A full in-process `StorageBackend`, backed by `Mutex<Vec<_>>` tables.
/// No indexes, no transactions — every search is a linear scan, which is
/// exactly the brute-force behavior the real backend falls back to.
#[derive(Default)]
pub struct InMemoryStorage {
    sessions: Mutex<Vec<(String, Uuid)>>,
    turns: Mutex<Vec<Turn>>,
    chunks: Mutex<Vec<Chunk>>,
    facts: Mutex<Vec<Fact>>,
    workflows: Mutex<Vec<Workflow>>,
    lessons: Mutex<Vec<Lesson>>,
    extraction_markers: Mutex<Vec<(Uuid, i64)>>,
    extraction_queue: Mutex<Vec<(Uuid, i64, bool)>>,
}

fn top_k<T: Clone>(items: &[T], query: &[f32], top_k_n: usize, embedding_of: impl Fn(&T) -> &[f32]) -> Vec<ScoredMatch<T>> {
    let mut scored: Vec<ScoredMatch<T>> = items
        .iter()
        .map(|item| ScoredMatch { item: item.clone(), score: cosine_similarity(query, embedding_of(item)) })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k_n);
    scored
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn get_or_create_session(&self, session_key: &str) -> Result<Uuid> {
        let mut sessions = self.sessions.lock();
        if let Some((_, id)) = sessions.iter().find(|(key, _)| key == session_key) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        sessions.push((session_key.to_string(), id));
        Ok(id)
    }

    async fn next_round_id(&self, session_id: Uuid) -> Result<i64> {
        let max = self.turns.lock().iter().filter(|t| t.session_id == session_id).map(|t| t.round_id).max();
        Ok(max.map_or(0, |m| m + 1))
    }

    async fn insert_turn(&self, turn: &Turn) -> Result<()> {
        self.turns.lock().push(turn.clone());
        Ok(())
    }

    async fn recent_turns(&self, session_id: Uuid, limit: usize) -> Result<Vec<Turn>> {
        let mut turns: Vec<Turn> =
            self.turns.lock().iter().filter(|t| t.session_id == session_id).cloned().collect();
        turns.sort_by(|a, b| b.round_id.cmp(&a.round_id));
        turns.truncate(limit);
        Ok(turns)
    }

    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<bool> {
        let mut chunks = self.chunks.lock();
        let exists = chunks
            .iter()
            .any(|c| c.document_source == chunk.document_source && c.content_hash == chunk.content_hash);
        if exists {
            return Ok(false);
        }
        chunks.push(chunk.clone());
        Ok(true)
    }

    async fn search_chunks(
        &self,
        query_embedding: &[f32],
        top_k_n: usize,
        document_source: Option<&str>,
        _sequential: bool,
    ) -> Result<Vec<ScoredMatch<Chunk>>> {
        let chunks = self.chunks.lock();
        let filtered: Vec<Chunk> = chunks
            .iter()
            .filter(|c| document_source.is_none_or(|source| c.document_source == source))
            .cloned()
            .collect();
        Ok(top_k(&filtered, query_embedding, top_k_n, |c| &c.embedding))
    }

    async fn insert_fact(&self, fact: &Fact) -> Result<Option<Uuid>> {
        let mut facts = self.facts.lock();
        let exists = facts
            .iter()
            .any(|f| f.session_id == fact.session_id && f.fact_type == fact.fact_type && f.content == fact.content);
        if exists {
            return Ok(None);
        }
        facts.push(fact.clone());
        Ok(Some(fact.fact_id))
    }

    async fn search_facts(
        &self,
        query_embedding: &[f32],
        top_k_n: usize,
        session_id: Option<Uuid>,
        fact_type: Option<FactType>,
    ) -> Result<Vec<ScoredMatch<Fact>>> {
        let facts = self.facts.lock();
        let filtered: Vec<Fact> = facts
            .iter()
            .filter(|f| session_id.is_none_or(|id| f.session_id == id))
            .filter(|f| fact_type.is_none_or(|ft| f.fact_type == ft))
            .cloned()
            .collect();
        Ok(top_k(&filtered, query_embedding, top_k_n, |f| &f.embedding))
    }

    async fn keyword_search_facts(
        &self,
        tokens: &[String],
        top_k_n: usize,
        session_id: Option<Uuid>,
    ) -> Result<Vec<ScoredMatch<Fact>>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
        let facts = self.facts.lock();
        let mut scored: Vec<ScoredMatch<Fact>> = facts
            .iter()
            .filter(|f| session_id.is_none_or(|id| f.session_id == id))
            .filter_map(|fact| {
                let content_lower = fact.content.to_lowercase();
                let hits = lowered.iter().filter(|t| content_lower.contains(t.as_str())).count();
                (hits > 0).then(|| ScoredMatch { item: fact.clone(), score: hits as f32 / lowered.len() as f32 })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k_n);
        Ok(scored)
    }

    async fn facts_by_session_and_type(&self, session_id: Uuid, fact_type: FactType) -> Result<Vec<Fact>> {
        Ok(self
            .facts
            .lock()
            .iter()
            .filter(|f| f.session_id == session_id && f.fact_type == fact_type)
            .cloned()
            .collect())
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut workflows = self.workflows.lock();
        if let Some(existing) = workflows.iter_mut().find(|w| w.workflow_id == workflow.workflow_id) {
            *existing = workflow.clone();
        } else {
            workflows.push(workflow.clone());
        }
        Ok(())
    }

    async fn search_workflows(&self, query_embedding: &[f32], top_k_n: usize) -> Result<Vec<ScoredMatch<Workflow>>> {
        let workflows = self.workflows.lock();
        Ok(top_k(&workflows, query_embedding, top_k_n, |w| &w.trigger_embedding))
    }

    async fn record_workflow_reuse(&self, workflow_id: Uuid) -> Result<()> {
        let mut workflows = self.workflows.lock();
        if let Some(workflow) = workflows.iter_mut().find(|w| w.workflow_id == workflow_id) {
            workflow.usage_count += 1;
            workflow.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<()> {
        self.lessons.lock().push(lesson.clone());
        Ok(())
    }

    async fn last_extracted_round(&self, session_id: Uuid) -> Result<Option<i64>> {
        Ok(self.extraction_markers.lock().iter().find(|(id, _)| *id == session_id).map(|(_, round)| *round))
    }

    async fn set_last_extracted_round(&self, session_id: Uuid, round_id: i64) -> Result<()> {
        let mut markers = self.extraction_markers.lock();
        if let Some(entry) = markers.iter_mut().find(|(id, _)| *id == session_id) {
            entry.1 = round_id;
        } else {
            markers.push((session_id, round_id));
        }
        Ok(())
    }

    async fn enqueue_extraction(&self, session_id: Uuid, round_id: i64) -> Result<()> {
        let mut queue = self.extraction_queue.lock();
        if !queue.iter().any(|(id, round, _)| *id == session_id && *round == round_id) {
            queue.push((session_id, round_id, false));
        }
        Ok(())
    }

    async fn pending_extractions(&self, limit: usize) -> Result<Vec<(Uuid, i64)>> {
        Ok(self
            .extraction_queue
            .lock()
            .iter()
            .filter(|(_, _, done)| !done)
            .take(limit)
            .map(|(id, round, _)| (*id, *round))
            .collect())
    }

    async fn complete_extraction(&self, session_id: Uuid, round_id: i64, _succeeded: bool) -> Result<()> {
        let mut queue = self.extraction_queue.lock();
        if let Some(entry) = queue.iter_mut().find(|(id, round, _)| *id == session_id && *round == round_id) {
            entry.2 = true;
        }
        Ok(())
    }

    async fn chunks_since(&self, since: DateTime<Utc>) -> Result<Vec<Chunk>> {
        // The fixture chunk has no created_at field of its own; treat every
        // stored chunk as current for test purposes.
        let _ = since;
        Ok(self.chunks.lock().clone())
    }
}
