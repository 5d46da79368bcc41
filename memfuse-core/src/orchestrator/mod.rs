//! Orchestrator: end-to-end handling of a complex-task request through the
//! `Reuse-Lookup -> (Plan | Fast-Path) -> Execute -> (Success | Fail)` state
//! machine (spec §4.4).

pub mod distillation;
pub mod planner;
pub mod subagent;

pub use planner::{Plan, PlanStep, Planner};
pub use subagent::{MockSubagent, Subagent, SubagentContext, SubagentOutput, SubagentRegistry};

use crate::config::MemFuseConfig;
use crate::embeddings::{cosine_similarity, Embedder};
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::storage::StorageBackend;
use crate::types::{Lesson, LessonStatus, Workflow};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// Outcome of a single task-mode request.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub output: serde_json::Value,
    pub reused_workflow: bool,
    pub distilled_workflow_id: Option<Uuid>,
}

/// Drives one task-mode request through the full state machine.
pub struct Orchestrator<E, L, S> {
    embedder: Arc<E>,
    storage: Arc<S>,
    planner: Planner<L>,
    registry: Arc<SubagentRegistry>,
    config: MemFuseConfig,
    /// Per-cluster locks guarding the dedup-check-then-upsert critical
    /// section during workflow distillation (spec §5's "at-most-once
    /// workflow creation under races").
    workflow_locks: parking_lot::Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
}

impl<E: Embedder, L: LanguageModel, S: StorageBackend> Orchestrator<E, L, S> {
    pub fn new(
        embedder: Arc<E>,
        model: Arc<L>,
        storage: Arc<S>,
        registry: Arc<SubagentRegistry>,
        config: MemFuseConfig,
    ) -> Self {
        Self {
            embedder,
            storage,
            planner: Planner::new(model),
            registry,
            config,
            workflow_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for the cluster `goal_embedding` quantizes into,
    /// serializing the dedup-check-then-upsert sequence against any other
    /// distillation landing in the same bucket.
    async fn lock_workflow_cluster(&self, goal_embedding: &[f32]) -> tokio::sync::OwnedMutexGuard<()> {
        let cluster = cluster_id(goal_embedding);
        let mutex = {
            let mut locks = self.workflow_locks.lock();
            Arc::clone(locks.entry(cluster).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        mutex.lock_owned().await
    }

    /// Look up an existing workflow whose trigger embedding is within the
    /// dedup threshold of `goal_embedding`, to be merged into rather than
    /// shadowed by a fresh row (spec §4.4.3's clustered identity).
    async fn find_duplicate_workflow(&self, goal_embedding: &[f32]) -> Result<Option<Workflow>> {
        let hits = self.storage.search_workflows(goal_embedding, 1).await?;
        Ok(hits
            .into_iter()
            .find(|hit| hit.score >= self.config.workflow_dedup_threshold)
            .map(|hit| hit.item))
    }

    /// Run the full `Reuse-Lookup -> (Plan | Fast-Path) -> Execute ->
    /// (Success | Fail)` state machine for one goal.
    pub async fn run(&self, session_id: Uuid, goal: &str) -> Result<TaskOutcome> {
        let goal_embedding = self.embedder.embed(goal).await?;

        if let Some((workflow, score)) = self.reuse_lookup(goal, &goal_embedding).await? {
            let _ = score;
            let steps = workflow.successful_workflow.clone();
            match self.execute(session_id, goal, &goal_embedding, &steps).await {
                Ok((output, _)) => {
                    self.storage.record_workflow_reuse(workflow.workflow_id).await?;
                    return Ok(TaskOutcome {
                        output,
                        reused_workflow: true,
                        distilled_workflow_id: Some(workflow.workflow_id),
                    });
                }
                Err(err) => {
                    // A stale fast-path plan falls back to full planning
                    // rather than failing the task outright.
                    tracing::warn!("fast-path reuse failed, falling back to planning: {err}");
                }
            }
        }

        let plan = self.planner.plan(goal, &self.registry).await?;
        let (output, prior_outputs) =
            self.execute(session_id, goal, &goal_embedding, &plan.steps_as_workflow_steps()).await?;

        let distilled_id = if self.config.m3_enabled {
            let template = distillation::templatize(&plan, &prior_outputs);
            let mut workflow = distillation::distill(goal, goal_embedding.clone(), template);

            let _guard = self.lock_workflow_cluster(&goal_embedding).await;
            if let Some(existing) = self.find_duplicate_workflow(&goal_embedding).await? {
                workflow.workflow_id = existing.workflow_id;
                workflow.usage_count = existing.usage_count;
                workflow.created_at = existing.created_at;
            }

            let id = workflow.workflow_id;
            self.storage.upsert_workflow(&workflow).await?;
            Some(id)
        } else {
            None
        };

        Ok(TaskOutcome { output, reused_workflow: false, distilled_workflow_id: distilled_id })
    }

    async fn reuse_lookup(
        &self,
        goal: &str,
        goal_embedding: &[f32],
    ) -> Result<Option<(crate::types::Workflow, f32)>> {
        if !self.config.m3_enabled {
            return Ok(None);
        }

        let hits = self.storage.search_workflows(goal_embedding, 1).await?;
        let Some(top) = hits.into_iter().next() else { return Ok(None) };

        if top.score < self.config.procedural_reuse_threshold {
            return Ok(None);
        }
        if let Some(pattern) = &top.item.trigger_pattern {
            if !pattern_matches(pattern, goal) {
                return Ok(None);
            }
        }

        Ok(Some((top.item, top.score)))
    }

    /// Execute steps sequentially, feeding named prior outputs forward and
    /// repairing a failing step's params up to `step_retries` times before
    /// recording a Lesson and failing the task.
    async fn execute(
        &self,
        session_id: Uuid,
        goal: &str,
        goal_embedding: &[f32],
        steps: &[crate::types::WorkflowStep],
    ) -> Result<(serde_json::Value, HashMap<String, serde_json::Value>)> {
        let mut prior_outputs: HashMap<String, serde_json::Value> = HashMap::new();
        let mut last_output = serde_json::Value::Null;

        for (index, step) in steps.iter().enumerate() {
            let slot_name = format!("step{index}");
            let agent = self
                .registry
                .get(&step.agent)
                .ok_or_else(|| Error::Invariant(format!("unknown agent at execute time: {}", step.agent)))?;

            let context = SubagentContext {
                session_id,
                user_id: None,
                prior_outputs: prior_outputs.clone(),
            };

            let mut params = resolve_template(&step.params_template, &prior_outputs);
            let mut attempt = 0;
            let outcome = loop {
                match agent.execute(&params, &context).await {
                    Ok(output) => break Ok(output),
                    Err(err) if attempt < self.config.step_retries => {
                        attempt += 1;
                        params = repair_params(&params, &err);
                        continue;
                    }
                    Err(err) => break Err(err),
                }
            };

            match outcome {
                Ok(output) => {
                    last_output = output.output.clone();
                    prior_outputs.insert(slot_name, output.output);
                }
                Err(err) => {
                    let lesson = Lesson {
                        lesson_id: Uuid::new_v4(),
                        trigger_embedding: goal_embedding.to_vec(),
                        goal_text: goal.to_string(),
                        agent: step.agent.clone(),
                        status: LessonStatus::Fail,
                        error: Some(err.to_string()),
                        fix_summary: None,
                        working_params: None,
                        created_at: chrono::Utc::now(),
                    };
                    self.storage.insert_lesson(&lesson).await?;
                    return Err(Error::StepExecution(format!("{}: {err}", step.agent)));
                }
            }
        }

        Ok((last_output, prior_outputs))
    }
}

impl Plan {
    fn steps_as_workflow_steps(&self) -> Vec<crate::types::WorkflowStep> {
        self.steps
            .iter()
            .map(|step| crate::types::WorkflowStep {
                agent: step.agent_name.clone(),
                params_template: step.params.clone(),
            })
            .collect()
    }
}

/// Resolves `{{stepN}}` placeholders against accumulated prior outputs.
fn resolve_template(
    template: &serde_json::Value,
    prior_outputs: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    match template {
        serde_json::Value::String(s) => {
            if let Some(slot) = s.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
                prior_outputs.get(slot).cloned().unwrap_or_else(|| template.clone())
            } else {
                template.clone()
            }
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), resolve_template(v, prior_outputs))).collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve_template(v, prior_outputs)).collect())
        }
        other => other.clone(),
    }
}

/// Best-effort param repair: drop nothing, just surface the error text as an
/// extra `_repair_hint` field for the next attempt's subagent call.
fn repair_params(params: &serde_json::Value, err: &Error) -> serde_json::Value {
    let mut repaired = params.clone();
    if let serde_json::Value::Object(map) = &mut repaired {
        map.insert("_repair_hint".to_string(), serde_json::json!(err.to_string()));
    }
    repaired
}

/// Quantizes an embedding to a coarse bucket id so that near-duplicate
/// embeddings (the ones the dedup threshold is meant to catch) usually land
/// on the same lock. This is an approximation, not an exact clustering: two
/// embeddings just across a rounding boundary can still miss each other and
/// race, which the dedup check after the lock is taken still catches for
/// any caller that does land on the same bucket.
fn cluster_id(embedding: &[f32]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for value in embedding {
        let bucket = (value * 10.0).round() as i32;
        bucket.hash(&mut hasher);
    }
    hasher.finish()
}

fn pattern_matches(pattern: &str, goal: &str) -> bool {
    let goal_lower = goal.to_lowercase();
    pattern.split_whitespace().any(|word| goal_lower.contains(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::MockEmbedder;
    use crate::llm::MockLanguageModel;
    use crate::storage::ScoredMatch;
    use crate::types::Workflow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryStorage {
        workflows: Mutex<Vec<Workflow>>,
        lessons: Mutex<Vec<Lesson>>,
    }

    #[async_trait]
    impl StorageBackend for InMemoryStorage {
        async fn get_or_create_session(&self, _session_key: &str) -> Result<Uuid> {
            Ok(Uuid::new_v4())
        }
        async fn next_round_id(&self, _session_id: Uuid) -> Result<i64> {
            Ok(0)
        }
        async fn insert_turn(&self, _turn: &crate::types::Turn) -> Result<()> {
            Ok(())
        }
        async fn recent_turns(&self, _session_id: Uuid, _limit: usize) -> Result<Vec<crate::types::Turn>> {
            Ok(Vec::new())
        }
        async fn upsert_chunk(&self, _chunk: &crate::types::Chunk) -> Result<bool> {
            Ok(true)
        }
        async fn search_chunks(
            &self,
            _query_embedding: &[f32],
            _top_k: usize,
            _document_source: Option<&str>,
            _sequential: bool,
        ) -> Result<Vec<ScoredMatch<crate::types::Chunk>>> {
            Ok(Vec::new())
        }
        async fn insert_fact(&self, _fact: &crate::types::Fact) -> Result<Option<Uuid>> {
            Ok(None)
        }
        async fn search_facts(
            &self,
            _query_embedding: &[f32],
            _top_k: usize,
            _session_id: Option<Uuid>,
            _fact_type: Option<crate::types::FactType>,
        ) -> Result<Vec<ScoredMatch<crate::types::Fact>>> {
            Ok(Vec::new())
        }
        async fn keyword_search_facts(
            &self,
            _tokens: &[String],
            _top_k: usize,
            _session_id: Option<Uuid>,
        ) -> Result<Vec<ScoredMatch<crate::types::Fact>>> {
            Ok(Vec::new())
        }
        async fn facts_by_session_and_type(
            &self,
            _session_id: Uuid,
            _fact_type: crate::types::FactType,
        ) -> Result<Vec<crate::types::Fact>> {
            Ok(Vec::new())
        }
        async fn upsert_workflow(&self, workflow: &Workflow) -> Result<()> {
            self.workflows.lock().unwrap().push(workflow.clone());
            Ok(())
        }
        async fn search_workflows(
            &self,
            query_embedding: &[f32],
            top_k: usize,
        ) -> Result<Vec<ScoredMatch<Workflow>>> {
            let mut scored: Vec<_> = self
                .workflows
                .lock()
                .unwrap()
                .iter()
                .map(|w| ScoredMatch { item: w.clone(), score: cosine_similarity(query_embedding, &w.trigger_embedding) })
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            scored.truncate(top_k);
            Ok(scored)
        }
        async fn record_workflow_reuse(&self, workflow_id: Uuid) -> Result<()> {
            let mut workflows = self.workflows.lock().unwrap();
            if let Some(w) = workflows.iter_mut().find(|w| w.workflow_id == workflow_id) {
                w.usage_count += 1;
            }
            Ok(())
        }
        async fn insert_lesson(&self, lesson: &Lesson) -> Result<()> {
            self.lessons.lock().unwrap().push(lesson.clone());
            Ok(())
        }
        async fn last_extracted_round(&self, _session_id: Uuid) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn set_last_extracted_round(&self, _session_id: Uuid, _round_id: i64) -> Result<()> {
            Ok(())
        }
        async fn enqueue_extraction(&self, _session_id: Uuid, _round_id: i64) -> Result<()> {
            Ok(())
        }
        async fn pending_extractions(&self, _limit: usize) -> Result<Vec<(Uuid, i64)>> {
            Ok(Vec::new())
        }
        async fn complete_extraction(&self, _session_id: Uuid, _round_id: i64, _succeeded: bool) -> Result<()> {
            Ok(())
        }
        async fn chunks_since(&self, _since: chrono::DateTime<chrono::Utc>) -> Result<Vec<crate::types::Chunk>> {
            Ok(Vec::new())
        }
    }

    fn registry() -> Arc<SubagentRegistry> {
        let registry = SubagentRegistry::new();
        for agent in subagent::named_mock_catalog() {
            registry.register(agent);
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn plans_and_executes_when_no_workflow_exists() {
        let embedder = Arc::new(MockEmbedder::default());
        let model = Arc::new(MockLanguageModel::constant(
            r#"{"steps": [{"agent_name": "rag_query", "params": {"q": "goal"}}]}"#,
        ));
        let storage = Arc::new(InMemoryStorage::default());
        let orchestrator = Orchestrator::new(embedder, model, storage, registry(), MemFuseConfig::default());

        let outcome = orchestrator.run(Uuid::new_v4(), "find the quarterly report").await.unwrap();
        assert!(!outcome.reused_workflow);
        assert!(outcome.distilled_workflow_id.is_some());
    }

    #[tokio::test]
    async fn step_failure_records_a_lesson() {
        let embedder = Arc::new(MockEmbedder::default());
        let model = Arc::new(MockLanguageModel::constant(
            r#"{"steps": [{"agent_name": "db_query", "params": {}}]}"#,
        ));
        let storage = Arc::new(InMemoryStorage::default());
        let registry = SubagentRegistry::new();
        registry.register(Arc::new(MockSubagent::failing_first("db_query", 10)));
        let mut config = MemFuseConfig::default();
        config.step_retries = 1;

        let orchestrator = Orchestrator::new(embedder, model, Arc::clone(&storage), Arc::new(registry), config);
        let result = orchestrator.run(Uuid::new_v4(), "query the database").await;
        assert!(result.is_err());
        assert_eq!(storage.lessons.lock().unwrap().len(), 1);
    }
}
