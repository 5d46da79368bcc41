//! Core data model: Turn (M1 episodic), Chunk (M1 document), Fact (M2
//! structured), Workflow (M3 procedural), and Lesson (auxiliary).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Fixed embedding width produced by the Embedder.
pub const EMBEDDING_DIM: usize = 1024;

/// Speaker of a turn within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// A single user or assistant utterance within a session (M1 episodic).
///
/// Identity is `(session_id, round_id, speaker)`. Append-only; one round
/// bundles a user turn and its assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: Uuid,
    /// Monotonically increasing per session (dense: 0, 1, 2, ...).
    pub round_id: i64,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    #[must_use]
    pub fn new(session_id: Uuid, round_id: i64, speaker: Speaker, content: impl Into<String>) -> Self {
        Self {
            session_id,
            round_id,
            speaker,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A document chunk ingested into M1 document memory.
///
/// Uniqueness invariant: at most one row per `(document_source,
/// content_hash)`; re-ingesting identical content is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub document_source: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub content_hash: String,
}

/// Discriminator for a structured fact mined by the Extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Fact,
    Decision,
    Assumption,
    UserPreference,
}

/// Recognized relation keys on a [`Fact`]. `based_on` and `supports` can
/// form DAGs; `contradicts` can form cycles across inserts over time — never
/// traverse either without a visited set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactRelations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub based_on: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contradicts: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supports: Vec<Uuid>,
}

/// A typed atomic statement mined from a round (M2 structured memory).
///
/// Uniqueness invariant: `(session_id, type, content)` is unique — identical
/// facts are collapsed at insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: Uuid,
    pub session_id: Uuid,
    pub source_round_id: i64,
    #[serde(rename = "type")]
    pub fact_type: FactType,
    pub content: String,
    #[serde(default)]
    pub relations: FactRelations,
    /// Free map; the recognized key `confidence` is a number in [0, 1].
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    #[must_use]
    pub fn confidence(&self) -> Option<f64> {
        self.metadata.get("confidence").and_then(serde_json::Value::as_f64)
    }
}

/// One step of a [`Workflow`]'s plan: an agent invocation with a params
/// template whose placeholders refer to the goal text or prior-step outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub agent: String,
    pub params_template: serde_json::Value,
}

/// A reusable plan template distilled from a successful task execution (M3
/// procedural memory), keyed by trigger embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub trigger_embedding: Vec<f32>,
    /// Optional substring/regex extracted from keywords of the goal text.
    pub trigger_pattern: Option<String>,
    pub successful_workflow: Vec<WorkflowStep>,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a single step-level execution, recorded to bias future
/// planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Success,
    Fail,
}

/// A recorded step-level success or failure, attached to M3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub lesson_id: Uuid,
    pub trigger_embedding: Vec<f32>,
    pub goal_text: String,
    pub agent: String,
    pub status: LessonStatus,
    pub error: Option<String>,
    pub fix_summary: Option<String>,
    pub working_params: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Content hash used for chunk/recall dedup, computed by the Embedder
/// alongside the embedding itself (spec: "deterministic content hash").
#[must_use]
pub fn content_hash(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    // SipHash via DefaultHasher is stable within a process but not across
    // Rust versions; a fixed-output hash is used instead so the
    // `(document_source, content_hash)` uniqueness invariant holds across
    // restarts and process boundaries.
    let digest = blake3_like_hash(text.as_bytes());
    let mut hasher = DefaultHasher::new();
    digest.hash(&mut hasher);
    format!("{:016x}{:016x}", digest, hasher.finish())
}

/// FNV-1a 128-bit style fold, used so `content_hash` is a pure function of
/// the bytes with no OS/process-dependent seeding.
fn blake3_like_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash("Plan B was rejected because of cost overruns of 40%.");
        let b = content_hash("Plan B was rejected because of cost overruns of 40%.");
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_differs_for_different_content() {
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn fact_confidence_reads_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("confidence".to_string(), serde_json::json!(0.82));
        let fact = Fact {
            fact_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            source_round_id: 0,
            fact_type: FactType::Decision,
            content: "We decided to ship on Monday.".to_string(),
            relations: FactRelations::default(),
            metadata,
            embedding: vec![0.0; EMBEDDING_DIM],
            created_at: Utc::now(),
        };
        assert_eq!(fact.confidence(), Some(0.82));
    }
}
