//! Router: the single entry point that owns session identity and decides
//! chat vs task mode (spec §4.5).

use crate::config::MemFuseConfig;
use crate::context::{count_tokens, ComposeRequest, ComposedContext, ContextController};
use crate::embeddings::{Embedder, EmbeddingCache};
use crate::error::Result;
use crate::extraction::{evaluate_trigger, ExtractionWorkerPool, Extractor, TriggerDecision};
use crate::llm::{CompletionParams, LanguageModel, Message};
use crate::orchestrator::{Orchestrator, SubagentRegistry, TaskOutcome};
use crate::retrieval::{bias_toward_workflows, RetrieveRequest, Retriever};
use crate::storage::StorageBackend;
use crate::types::{Speaker, Turn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Whether a request carries `tag=m3`, which forces task mode on write and
/// workflow-biased recall on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    None,
    M3,
}

impl Tag {
    #[must_use]
    pub fn from_str(raw: Option<&str>) -> Self {
        match raw {
            Some(tag) if tag.eq_ignore_ascii_case("m3") => Tag::M3,
            _ => Tag::None,
        }
    }
}

/// A resolved incoming request, after session lookup.
#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub session_key: String,
    pub user_id: Option<String>,
    pub message: String,
    pub tag: Tag,
}

/// Outcome of dispatching a single request, either path.
#[derive(Debug)]
pub enum RouterOutcome {
    Chat { prompt: String, reply: String },
    Task(TaskOutcome),
}

/// Owns session resolution and dispatches each request to the chat path
/// (Context + LLM + Store) or the task path (Orchestrator).
pub struct Router<E, L, S> {
    model: Arc<L>,
    storage: Arc<S>,
    context: ContextController,
    retriever: Retriever<EmbeddingCache<E>, S>,
    orchestrator: Orchestrator<EmbeddingCache<E>, L, S>,
    extractor: Arc<Extractor<EmbeddingCache<E>, L, S>>,
    extraction_pool: Option<ExtractionWorkerPool>,
    /// Per-session held across the round_id-allocation-through-persist
    /// critical section (spec §5).
    session_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Per-session accumulated token count since the last enqueue, feeding
    /// the extractor's batch trigger rule (spec §4.3).
    pending_extraction_tokens: Mutex<HashMap<Uuid, usize>>,
    config: MemFuseConfig,
}

impl<E: Embedder + 'static, L: LanguageModel + 'static, S: StorageBackend + 'static> Router<E, L, S> {
    pub fn new(
        embedder: Arc<E>,
        model: Arc<L>,
        storage: Arc<S>,
        registry: Arc<SubagentRegistry>,
        config: MemFuseConfig,
    ) -> Self {
        // Every embed call in the assembled system goes through one
        // coalescing cache instance, so concurrent lookups for the same text
        // across the Retriever, Orchestrator, and Extractor share a single
        // in-flight request (spec §5).
        let embedder = Arc::new(EmbeddingCache::new(embedder, config.embedding_cache_capacity));

        let context = ContextController::new(config.clone());
        let retriever = Retriever::new(Arc::clone(&embedder), Arc::clone(&storage), config.clone());
        let orchestrator = Orchestrator::new(
            Arc::clone(&embedder),
            Arc::clone(&model),
            Arc::clone(&storage),
            registry,
            config.clone(),
        );
        let extractor = Arc::new(Extractor::new(
            Arc::clone(&embedder),
            Arc::clone(&model),
            Arc::clone(&storage),
            config.clone(),
        ));
        let extraction_pool = config.extractor_enabled.then(|| {
            ExtractionWorkerPool::spawn(Arc::clone(&extractor), Arc::clone(&storage), 2, Duration::from_secs(5))
        });
        Self {
            model,
            storage,
            context,
            retriever,
            orchestrator,
            extractor,
            extraction_pool,
            session_locks: Mutex::new(HashMap::new()),
            pending_extraction_tokens: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Resolve the session key to a stable id, creating one on first use.
    pub async fn resolve_session(&self, session_key: &str) -> Result<Uuid> {
        self.storage.get_or_create_session(session_key).await
    }

    /// Stop accepting background extraction jobs and wait for in-flight
    /// ones to drain. Never cancels a job mid-way.
    pub async fn shutdown(self) {
        if let Some(pool) = self.extraction_pool {
            pool.shutdown().await;
        }
    }

    fn session_lock(&self, session_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock();
        Arc::clone(locks.entry(session_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    pub async fn dispatch(&self, request: &RouterRequest) -> Result<RouterOutcome> {
        let session_id = self.resolve_session(&request.session_key).await?;

        let enters_task_mode = request.tag == Tag::M3
            || (self.config.orchestrator_classifier_enabled && self.classify_is_task(&request.message).await?);

        if enters_task_mode {
            let outcome = self.orchestrator.run(session_id, &request.message).await?;
            return Ok(RouterOutcome::Task(outcome));
        }

        let reply = self.chat(session_id, request).await?;
        Ok(RouterOutcome::Chat { prompt: reply.0, reply: reply.1 })
    }

    async fn chat(&self, session_id: Uuid, request: &RouterRequest) -> Result<(String, String)> {
        let mut retrieve_request = RetrieveRequest::new(request.message.clone());
        retrieve_request.session_id = Some(session_id);
        retrieve_request.include_workflows = request.tag == Tag::M3;

        let mut recalled = self.retriever.retrieve(&retrieve_request).await?;
        if request.tag == Tag::M3 {
            recalled = bias_toward_workflows(recalled, 1.25);
        }

        // Held across round_id allocation through both turn inserts so two
        // concurrent requests on the same session can't race on the dense
        // per-session round_id sequence (spec §5).
        let lock = self.session_lock(session_id);
        let guard = lock.lock().await;

        let round_id = self.storage.next_round_id(session_id).await?;
        let history = self.storage.recent_turns(session_id, self.config.history_fetch_rounds).await?;

        let composed = self.context.compose(&ComposeRequest {
            system_prompt: "You are a helpful assistant with access to this user's memory.".to_string(),
            user_query: request.message.clone(),
            history,
            recalled,
        });

        let reply = self
            .model
            .complete(&[Message::user(composed.prompt.clone())], &CompletionParams::default())
            .await?;

        let user_turn = Turn::new(session_id, round_id, Speaker::User, request.message.clone());
        self.storage.insert_turn(&user_turn).await?;
        let assistant_turn = Turn::new(session_id, round_id, Speaker::Assistant, reply.clone());
        self.storage.insert_turn(&assistant_turn).await?;

        drop(guard);

        if self.config.extractor_enabled {
            self.maybe_trigger_extraction(session_id, round_id, &user_turn, &assistant_turn).await?;
        }

        Ok((composed.prompt, reply))
    }

    /// Evaluate the extractor's trigger rule for the round just persisted
    /// and either run it inline (immediate), enqueue the durable job
    /// (batch), or fold its tokens into the session's pending count
    /// (accumulate) (spec §4.3 "Trigger rules").
    async fn maybe_trigger_extraction(
        &self,
        session_id: Uuid,
        round_id: i64,
        user_turn: &Turn,
        assistant_turn: &Turn,
    ) -> Result<()> {
        let round_tokens = count_tokens(&user_turn.content) + count_tokens(&assistant_turn.content);
        let pending_tokens_after = {
            let mut pending = self.pending_extraction_tokens.lock();
            let entry = pending.entry(session_id).or_insert(0);
            *entry += round_tokens;
            *entry
        };

        match evaluate_trigger(&self.config, round_tokens, pending_tokens_after) {
            TriggerDecision::Accumulate => Ok(()),
            TriggerDecision::Immediate => {
                self.pending_extraction_tokens.lock().insert(session_id, 0);
                let rounds = [user_turn.clone(), assistant_turn.clone()];
                if let Err(err) = self.extractor.extract(session_id, &rounds).await {
                    tracing::warn!(
                        "immediate extraction failed for session {session_id}, falling back to queue: {err}"
                    );
                    self.storage.enqueue_extraction(session_id, round_id).await?;
                }
                Ok(())
            }
            TriggerDecision::Batch => {
                self.pending_extraction_tokens.lock().insert(session_id, 0);
                self.storage.enqueue_extraction(session_id, round_id).await
            }
        }
    }

    async fn classify_is_task(&self, message: &str) -> Result<bool> {
        let response = self
            .model
            .complete(
                &[
                    Message::system("Answer only `yes` or `no`: is this a multi-step task request?"),
                    Message::user(message),
                ],
                &CompletionParams::default(),
            )
            .await?;
        Ok(response.trim().eq_ignore_ascii_case("yes"))
    }
}

/// Exposed for tests that need to assert on a composed prompt directly
/// without going through a full [`Router::dispatch`] call.
#[must_use]
pub fn describe_context(composed: &ComposedContext) -> String {
    format!(
        "{} turns included, {} dropped; {} recall items included, {} dropped",
        composed.turns_included, composed.turns_dropped, composed.recall_items_included, composed.recall_items_dropped
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_parses_m3_case_insensitively() {
        assert_eq!(Tag::from_str(Some("M3")), Tag::M3);
        assert_eq!(Tag::from_str(Some("m3")), Tag::M3);
        assert_eq!(Tag::from_str(Some("other")), Tag::None);
        assert_eq!(Tag::from_str(None), Tag::None);
    }
}
