//! SQL schema for the five first-class tables, applied by an idempotent
//! migration runner on startup (spec.md §3, §6; SPEC_FULL.md §3).

/// Sessions table: maps an opaque session key to a stable uuid.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    session_key TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
)
"#;

/// Turns table (M1 episodic memory). `(session_id, round_id, speaker)` is
/// the composite identity; append-only.
pub const CREATE_TURNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS turns (
    session_id TEXT NOT NULL,
    round_id INTEGER NOT NULL,
    speaker TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (session_id, round_id, speaker)
)
"#;

/// Index for newest-first history scans.
pub const CREATE_TURNS_ORDER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_turns_session_round
ON turns(session_id, round_id DESC)
"#;

/// Document chunks table (M1 document memory). Unique on
/// `(document_source, content_hash)` so re-ingesting identical content is a
/// no-op.
pub const CREATE_DOCUMENT_CHUNKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS document_chunks (
    chunk_id TEXT PRIMARY KEY NOT NULL,
    document_source TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE (document_source, content_hash)
)
"#;

pub const CREATE_DOCUMENT_CHUNKS_SOURCE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_document_chunks_source
ON document_chunks(document_source)
"#;

/// Structured memory table (M2 facts/decisions/assumptions/preferences).
/// Unique on `(session_id, type, content)`.
pub const CREATE_STRUCTURED_MEMORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS structured_memory (
    fact_id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    source_round_id INTEGER NOT NULL,
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    relations TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE (session_id, type, content)
)
"#;

pub const CREATE_STRUCTURED_MEMORY_SESSION_TYPE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_structured_memory_session_type
ON structured_memory(session_id, type)
"#;

/// Procedural memory table (M3 workflows). `workflow_id` primary key,
/// `usage_count` defaults to 0 so a fresh distill starts at 1 via an
/// explicit insert value.
pub const CREATE_PROCEDURAL_MEMORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS procedural_memory (
    workflow_id TEXT PRIMARY KEY NOT NULL,
    trigger_embedding BLOB NOT NULL,
    trigger_pattern TEXT,
    successful_workflow TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// Procedural lessons table, auxiliary to M3: step-level outcomes recorded
/// on failure (and, optionally, success) for future planning bias.
pub const CREATE_PROCEDURAL_LESSONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS procedural_lessons (
    lesson_id TEXT PRIMARY KEY NOT NULL,
    trigger_embedding BLOB NOT NULL,
    goal_text TEXT NOT NULL,
    agent TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('success', 'fail')),
    error TEXT,
    fix_summary TEXT,
    working_params TEXT,
    created_at INTEGER NOT NULL
)
"#;

/// Durable extraction queue: a row per (session, round) pending background
/// extraction, surviving a crash/restart (spec §4.3 "Trigger rules").
pub const CREATE_EXTRACTION_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS extraction_queue (
    session_id TEXT NOT NULL,
    round_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'succeeded', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (session_id, round_id)
)
"#;

pub const CREATE_EXTRACTION_QUEUE_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_extraction_queue_status
ON extraction_queue(status, enqueued_at)
"#;

/// Durable per-session marker: the last round_id the extractor has
/// consumed, so a restart doesn't re-mine already-extracted rounds.
pub const CREATE_EXTRACTION_MARKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS extraction_markers (
    session_id TEXT PRIMARY KEY NOT NULL,
    last_extracted_round_id INTEGER NOT NULL
)
"#;

/// All statements, in dependency order, applied idempotently on startup.
#[must_use]
pub fn all_statements() -> Vec<&'static str> {
    vec![
        CREATE_SESSIONS_TABLE,
        CREATE_TURNS_TABLE,
        CREATE_TURNS_ORDER_INDEX,
        CREATE_DOCUMENT_CHUNKS_TABLE,
        CREATE_DOCUMENT_CHUNKS_SOURCE_INDEX,
        CREATE_STRUCTURED_MEMORY_TABLE,
        CREATE_STRUCTURED_MEMORY_SESSION_TYPE_INDEX,
        CREATE_PROCEDURAL_MEMORY_TABLE,
        CREATE_PROCEDURAL_LESSONS_TABLE,
        CREATE_EXTRACTION_QUEUE_TABLE,
        CREATE_EXTRACTION_QUEUE_STATUS_INDEX,
        CREATE_EXTRACTION_MARKERS_TABLE,
    ]
}
