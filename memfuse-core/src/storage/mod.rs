//! Storage abstraction over the four first-class tables plus the auxiliary
//! lesson table (spec §3, §6). A single trait lets the rest of the engine
//! stay agnostic to the concrete persistence backend.

use crate::error::Result;
use crate::types::{Chunk, Fact, FactType, Lesson, Turn, Workflow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A scored vector-search hit returned by similarity queries.
#[derive(Debug, Clone)]
pub struct ScoredMatch<T> {
    pub item: T,
    /// Cosine similarity in `[0, 1]`, higher is closer.
    pub score: f32,
}

/// Unified persistence trait implemented by the concrete storage backend.
///
/// All operations are async; a single implementation may serve both the
/// read path and the write path, or may internally route to a pool of
/// connections (spec §5, "bounded connection pool").
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Resolve a string session key to a stable session id, creating one if
    /// this is the first time the key has been seen.
    async fn get_or_create_session(&self, session_key: &str) -> Result<Uuid>;

    /// Next dense `round_id` for a session (0, 1, 2, ...). Called under the
    /// session mutex, so this and the subsequent `insert_turn` calls are
    /// serialized per session (spec §5).
    async fn next_round_id(&self, session_id: Uuid) -> Result<i64>;

    /// Append-only turn insert.
    async fn insert_turn(&self, turn: &Turn) -> Result<()>;

    /// Turns for a session, ordered newest-first, capped by `limit`.
    async fn recent_turns(&self, session_id: Uuid, limit: usize) -> Result<Vec<Turn>>;

    /// Upsert a document chunk. A no-op (by the `(document_source,
    /// content_hash)` uniqueness invariant) when the content already exists.
    /// Returns `true` if a new row was inserted.
    async fn upsert_chunk(&self, chunk: &Chunk) -> Result<bool>;

    /// Cosine top-k over chunk embeddings, optionally scoped to one document
    /// source (used for session-preferred recall).
    ///
    /// `sequential` requests the exhaustive fallback scan the Retriever
    /// falls back to when an approximate index returns zero rows on a small
    /// corpus (spec §4.2 step 6, §9). A brute-force backend can treat this
    /// as a no-op; an ANN-backed one would skip its index and scan directly.
    async fn search_chunks(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_source: Option<&str>,
        sequential: bool,
    ) -> Result<Vec<ScoredMatch<Chunk>>>;

    /// Insert a fact, collapsing at the `(session_id, type, content)`
    /// uniqueness invariant. Returns `None` when an identical fact already
    /// existed (absorbed no-op) or `Some(fact_id)` on a genuine insert.
    async fn insert_fact(&self, fact: &Fact) -> Result<Option<Uuid>>;

    /// Cosine top-k over fact embeddings, optionally scoped to a session and
    /// a fact type.
    async fn search_facts(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        session_id: Option<Uuid>,
        fact_type: Option<FactType>,
    ) -> Result<Vec<ScoredMatch<Fact>>>;

    /// Keyword/exact match over fact content, case-insensitive.
    async fn keyword_search_facts(
        &self,
        tokens: &[String],
        top_k: usize,
        session_id: Option<Uuid>,
    ) -> Result<Vec<ScoredMatch<Fact>>>;

    /// All facts of a given type for a session, used by the extractor's
    /// dedup/contradiction checks.
    async fn facts_by_session_and_type(
        &self,
        session_id: Uuid,
        fact_type: FactType,
    ) -> Result<Vec<Fact>>;

    /// Upsert a workflow. Called under the named lock keyed by trigger
    /// cluster id (spec §5); the backend itself does not need to serialize.
    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Cosine top-k over workflow trigger embeddings.
    async fn search_workflows(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredMatch<Workflow>>>;

    /// Bump `usage_count` by one and set `updated_at` to now.
    async fn record_workflow_reuse(&self, workflow_id: Uuid) -> Result<()>;

    /// Persist a step-level outcome.
    async fn insert_lesson(&self, lesson: &Lesson) -> Result<()>;

    /// Durable marker: last round_id the extractor has consumed for a
    /// session, surviving a crash/restart (spec §4.3).
    async fn last_extracted_round(&self, session_id: Uuid) -> Result<Option<i64>>;

    /// Advance the durable extraction marker.
    async fn set_last_extracted_round(&self, session_id: Uuid, round_id: i64) -> Result<()>;

    /// Enqueue a round for background extraction.
    async fn enqueue_extraction(&self, session_id: Uuid, round_id: i64) -> Result<()>;

    /// Pull pending extraction jobs (status = pending), oldest first.
    async fn pending_extractions(&self, limit: usize) -> Result<Vec<(Uuid, i64)>>;

    /// Mark an extraction job's outcome.
    async fn complete_extraction(&self, session_id: Uuid, round_id: i64, succeeded: bool) -> Result<()>;

    /// Rows modified since a timestamp — used by monitoring/sync tooling.
    async fn chunks_since(&self, since: DateTime<Utc>) -> Result<Vec<Chunk>>;
}
