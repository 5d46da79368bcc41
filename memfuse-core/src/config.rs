//! Immutable configuration for the MemFuse core engine.
//!
//! Built once from the environment (or explicit overrides) and passed
//! explicitly into the Router and every component; algorithms never read
//! ambient globals.

use std::time::Duration;

/// Recognized configuration keys and their effects, collected into one
/// value per the design notes.
#[derive(Debug, Clone)]
pub struct MemFuseConfig {
    /// Truncates oversize user queries (Context Controller).
    pub user_input_max_tokens: usize,
    /// Bounds included prior turns (Context Controller).
    pub history_max_tokens: usize,
    /// Hard cap on the final composed prompt (Context Controller).
    pub total_context_max_tokens: usize,

    /// Per-stream chunk recall cap (Retriever).
    pub rag_top_k: usize,
    /// Per-stream fact recall cap (Retriever).
    pub structured_top_k: usize,
    /// Selects session-scoped chunk index when available (Retriever).
    pub retrieval_prefer_session: bool,
    /// Enables M2 facts in the read path (Retriever).
    pub structured_enabled: bool,
    /// Per-stream workflow recall cap (Retriever).
    pub procedural_top_k: usize,
    /// Keyword-vs-vector fusion weight for fact scoring (Retriever §4.2).
    pub keyword_fusion_alpha: f32,

    /// Enables extractor background jobs.
    pub extractor_enabled: bool,
    /// Token threshold that triggers immediate extraction of a single round.
    pub extractor_trigger_tokens_single: usize,
    /// Pending-token threshold that triggers a batched extraction job.
    pub extractor_trigger_tokens_batch: usize,
    /// Max attempts before an extraction job gives up and records a lesson.
    pub extractor_max_attempts: u32,
    /// Near-dedup cosine similarity gate (M2).
    pub dedup_sim_threshold: f32,
    /// Contradiction-marking cosine similarity gate (M2).
    pub contradiction_sim_threshold: f32,
    /// Number of recent same-session facts given to the extractor as context.
    pub extractor_context_facts: usize,

    /// Enables workflow reuse + distillation (Orchestrator).
    pub m3_enabled: bool,
    /// Minimum similarity for M3 fast-path reuse.
    pub procedural_reuse_threshold: f32,
    /// Dedup similarity for collapsing near-duplicate workflows at distill time.
    pub workflow_dedup_threshold: f32,
    /// Retries (with parameter repair) per failed plan step.
    pub step_retries: u32,
    /// Whether task routing consults an internal classifier when no tag is
    /// present (Open Question 3: default is tag-only, classifier optional).
    pub orchestrator_classifier_enabled: bool,

    /// DB-side prefetch ceiling for history.
    pub history_fetch_rounds: usize,
    /// Fixed at 1024 per the Embedder contract.
    pub embedding_dim: usize,

    /// Per-request deadlines (spec §5).
    pub embed_deadline: Duration,
    pub chat_completion_deadline: Duration,
    pub structured_completion_deadline: Duration,
    pub task_deadline: Duration,

    /// Bounded Store connection pool size.
    pub storage_pool_size: usize,
    /// In-process embedding LRU cache capacity (by content hash).
    pub embedding_cache_capacity: usize,
}

impl Default for MemFuseConfig {
    fn default() -> Self {
        Self {
            user_input_max_tokens: 2_000,
            history_max_tokens: 4_000,
            total_context_max_tokens: 8_000,

            rag_top_k: 5,
            structured_top_k: 5,
            retrieval_prefer_session: true,
            structured_enabled: true,
            procedural_top_k: 3,
            keyword_fusion_alpha: 0.7,

            extractor_enabled: true,
            extractor_trigger_tokens_single: 1_500,
            extractor_trigger_tokens_batch: 3_000,
            extractor_max_attempts: 5,
            dedup_sim_threshold: 0.95,
            contradiction_sim_threshold: 0.88,
            extractor_context_facts: 8,

            m3_enabled: true,
            procedural_reuse_threshold: 0.9,
            workflow_dedup_threshold: 0.97,
            step_retries: 2,
            orchestrator_classifier_enabled: false,

            history_fetch_rounds: 50,
            embedding_dim: 1_024,

            embed_deadline: Duration::from_secs(30),
            chat_completion_deadline: Duration::from_secs(60),
            structured_completion_deadline: Duration::from_secs(120),
            task_deadline: Duration::from_secs(600),

            storage_pool_size: 10,
            embedding_cache_capacity: 4_096,
        }
    }
}

impl MemFuseConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        set_usize(&mut config.user_input_max_tokens, "MEMFUSE_USER_INPUT_MAX_TOKENS");
        set_usize(&mut config.history_max_tokens, "MEMFUSE_HISTORY_MAX_TOKENS");
        set_usize(&mut config.total_context_max_tokens, "MEMFUSE_TOTAL_CONTEXT_MAX_TOKENS");

        set_usize(&mut config.rag_top_k, "MEMFUSE_RAG_TOP_K");
        set_usize(&mut config.structured_top_k, "MEMFUSE_STRUCTURED_TOP_K");
        set_bool(&mut config.retrieval_prefer_session, "MEMFUSE_RETRIEVAL_PREFER_SESSION");
        set_bool(&mut config.structured_enabled, "MEMFUSE_STRUCTURED_ENABLED");
        set_usize(&mut config.procedural_top_k, "MEMFUSE_PROCEDURAL_TOP_K");

        set_bool(&mut config.extractor_enabled, "MEMFUSE_EXTRACTOR_ENABLED");
        set_usize(
            &mut config.extractor_trigger_tokens_single,
            "MEMFUSE_EXTRACTOR_TRIGGER_TOKENS_SINGLE",
        );
        set_usize(
            &mut config.extractor_trigger_tokens_batch,
            "MEMFUSE_EXTRACTOR_TRIGGER_TOKENS_BATCH",
        );
        set_f32(&mut config.dedup_sim_threshold, "MEMFUSE_DEDUP_SIM_THRESHOLD");
        set_f32(
            &mut config.contradiction_sim_threshold,
            "MEMFUSE_CONTRADICTION_SIM_THRESHOLD",
        );

        set_bool(&mut config.m3_enabled, "MEMFUSE_M3_ENABLED");
        set_f32(
            &mut config.procedural_reuse_threshold,
            "MEMFUSE_PROCEDURAL_REUSE_THRESHOLD",
        );
        set_bool(
            &mut config.orchestrator_classifier_enabled,
            "MEMFUSE_ORCHESTRATOR_CLASSIFIER_ENABLED",
        );

        set_usize(&mut config.history_fetch_rounds, "MEMFUSE_HISTORY_FETCH_ROUNDS");
        set_usize(&mut config.storage_pool_size, "MEMFUSE_STORAGE_POOL_SIZE");

        config
    }
}

fn set_usize(field: &mut usize, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!("invalid value for {key}: {raw}, keeping default"),
        }
    }
}

fn set_f32(field: &mut f32, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<f32>() {
            Ok(value) => *field = value.clamp(0.0, 1.0),
            Err(_) => tracing::warn!("invalid value for {key}: {raw}, keeping default"),
        }
    }
}

fn set_bool(field: &mut bool, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        *field = matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = MemFuseConfig::default();
        assert_eq!(config.embedding_dim, 1_024);
        assert_eq!(config.procedural_reuse_threshold, 0.9);
        assert_eq!(config.dedup_sim_threshold, 0.95);
        assert_eq!(config.contradiction_sim_threshold, 0.88);
        assert_eq!(config.step_retries, 2);
        assert!(!config.orchestrator_classifier_enabled);
    }

    #[test]
    fn from_env_overrides_defaults() {
        std::env::set_var("MEMFUSE_RAG_TOP_K", "12");
        let config = MemFuseConfig::from_env();
        assert_eq!(config.rag_top_k, 12);
        std::env::remove_var("MEMFUSE_RAG_TOP_K");
    }
}
