//! Extractor: turns a completed round into structured facts asynchronously,
//! without blocking the user-visible response (spec §4.3).

mod candidates;
mod worker;

pub use candidates::Candidate;
pub use worker::ExtractionWorkerPool;

use crate::config::MemFuseConfig;
use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::llm::{CompletionParams, LanguageModel, Message};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::storage::StorageBackend;
use crate::types::{Fact, FactRelations, FactType, Turn};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Decision made by the extractor's trigger rule after a round completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Enqueue this round right now.
    Immediate,
    /// Fold into the session's pending batch; not yet enqueued.
    Accumulate,
    /// Pending tokens crossed the batch threshold; enqueue the whole batch.
    Batch,
}

/// Stateless trigger-rule evaluation (spec §4.3 "Trigger rules"). The
/// caller is responsible for tracking `pending_tokens` per session across
/// calls (kept in the durable queue, not here).
#[must_use]
pub fn evaluate_trigger(
    config: &MemFuseConfig,
    round_tokens: usize,
    pending_tokens_after: usize,
) -> TriggerDecision {
    if round_tokens > config.extractor_trigger_tokens_single {
        TriggerDecision::Immediate
    } else if pending_tokens_after > config.extractor_trigger_tokens_batch {
        TriggerDecision::Batch
    } else {
        TriggerDecision::Accumulate
    }
}

/// The JSON schema the language model must satisfy when mining candidates
/// from a round, consumed via [`LanguageModel::complete_json`].
#[must_use]
pub fn candidate_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["candidates"],
        "properties": {
            "candidates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "content"],
                    "properties": {
                        "type": {"type": "string"},
                        "content": {"type": "string"},
                        "relations": {"type": "object"},
                        "confidence": {"type": "number"},
                        "contradicts_hint": {"type": "boolean"},
                    }
                }
            }
        }
    })
}

/// Mines, dedups, and persists facts for one or more rounds belonging to the
/// same session (spec §4.3 "Job protocol").
pub struct Extractor<E, L, S> {
    embedder: Arc<E>,
    model: Arc<L>,
    storage: Arc<S>,
    config: MemFuseConfig,
}

/// Outcome of a single extraction job, used for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub candidates_seen: usize,
    pub inserted: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    pub contradictions: usize,
}

impl<E: Embedder, L: LanguageModel, S: StorageBackend> Extractor<E, L, S> {
    pub fn new(embedder: Arc<E>, model: Arc<L>, storage: Arc<S>, config: MemFuseConfig) -> Self {
        Self { embedder, model, storage, config }
    }

    /// Run the full job protocol for one batch of rounds, with
    /// exponential-backoff retry up to `extractor_max_attempts` (spec §4.3
    /// "Failure semantics").
    pub async fn extract(&self, session_id: Uuid, rounds: &[Turn]) -> Result<ExtractionOutcome> {
        let retry_config = RetryConfig {
            max_retries: self.config.extractor_max_attempts.saturating_sub(1),
            ..RetryConfig::default()
        };
        let mut policy = RetryPolicy::with_config(retry_config);
        policy.execute(|| self.run_once(session_id, rounds)).await
    }

    async fn run_once(&self, session_id: Uuid, rounds: &[Turn]) -> Result<ExtractionOutcome> {
        let round_text = rounds
            .iter()
            .map(|turn| turn.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let query_embedding = self.embedder.embed(&round_text).await?;
        let recent_facts = self.recent_context_facts(session_id, &query_embedding).await?;

        let raw = self.model.complete_json(
            &[
                Message::system(
                    "Extract structured facts, decisions, assumptions, and user \
                     preferences from the conversation round. Return only JSON.",
                ),
                Message::user(format!(
                    "Recent known facts:\n{}\n\nNew round:\n{round_text}",
                    recent_facts.iter().map(|f| f.content.as_str()).collect::<Vec<_>>().join("\n")
                )),
            ],
            &candidate_schema(),
            &CompletionParams::default(),
        ).await?;

        let candidates = candidates::parse(&raw);
        let deduped = candidates::mece_cluster(candidates);

        let mut outcome = ExtractionOutcome { candidates_seen: deduped.len(), ..Default::default() };
        let source_round_id = rounds.last().map_or(0, |turn| turn.round_id);

        for candidate in deduped {
            let embedding = self.embedder.embed(&candidate.content).await?;
            let fact_type = candidate.fact_type;

            let existing = self.storage.facts_by_session_and_type(session_id, fact_type).await?;

            if existing.iter().any(|f| f.content == candidate.content) {
                outcome.exact_duplicates += 1;
                continue;
            }

            let mut best: Option<(&Fact, f32)> = None;
            for fact in &existing {
                let score = cosine_similarity(&embedding, &fact.embedding);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((fact, score));
                }
            }

            let mut relations = FactRelations::default();
            if let Some((fact, score)) = best {
                if score >= self.config.dedup_sim_threshold {
                    outcome.near_duplicates += 1;
                    continue;
                }
                if score >= self.config.contradiction_sim_threshold && candidate.contradicts_hint {
                    relations.contradicts = Some(fact.fact_id);
                    outcome.contradictions += 1;
                }
            }

            let mut metadata = HashMap::new();
            metadata.insert("confidence".to_string(), serde_json::json!(candidate.confidence));

            let fact = Fact {
                fact_id: Uuid::new_v4(),
                session_id,
                source_round_id,
                fact_type,
                content: candidate.content,
                relations,
                metadata,
                embedding,
                created_at: chrono::Utc::now(),
            };

            if self.storage.insert_fact(&fact).await?.is_some() {
                outcome.inserted += 1;
            } else {
                outcome.exact_duplicates += 1;
            }
        }

        Ok(outcome)
    }

    async fn recent_context_facts(&self, session_id: Uuid, query_embedding: &[f32]) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        for fact_type in [FactType::Fact, FactType::Decision, FactType::Assumption, FactType::UserPreference] {
            facts.extend(self.storage.facts_by_session_and_type(session_id, fact_type).await?);
        }
        facts.sort_by(|a, b| {
            let score_a = cosine_similarity(query_embedding, &a.embedding);
            let score_b = cosine_similarity(query_embedding, &b.embedding);
            score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        facts.truncate(self.config.extractor_context_facts);
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_trigger_on_oversize_round() {
        let config = MemFuseConfig::default();
        let decision = evaluate_trigger(&config, config.extractor_trigger_tokens_single + 1, 0);
        assert_eq!(decision, TriggerDecision::Immediate);
    }

    #[test]
    fn batch_trigger_once_pending_crosses_threshold() {
        let config = MemFuseConfig::default();
        let decision = evaluate_trigger(&config, 10, config.extractor_trigger_tokens_batch + 1);
        assert_eq!(decision, TriggerDecision::Batch);
    }

    #[test]
    fn small_round_accumulates() {
        let config = MemFuseConfig::default();
        let decision = evaluate_trigger(&config, 10, 10);
        assert_eq!(decision, TriggerDecision::Accumulate);
    }
}
