//! Subagent contract and registry (spec §4.4.4, §4.4.1 expansion).

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;
use serde_json::Value;

/// Context passed to every subagent invocation.
#[derive(Debug, Clone)]
pub struct SubagentContext {
    pub session_id: Uuid,
    pub user_id: Option<String>,
    /// Named outputs of prior steps in the same plan.
    pub prior_outputs: HashMap<String, Value>,
}

/// Result of a single subagent invocation.
#[derive(Debug, Clone)]
pub struct SubagentOutput {
    pub output: Value,
    pub artifacts: Vec<String>,
}

/// Every subagent exposes a single operation plus a parameter schema used
/// for plan validation and repair (spec §4.4.4).
#[async_trait]
pub trait Subagent: Send + Sync {
    fn name(&self) -> &str;

    /// JSON schema new plan steps' `params` are validated against.
    fn param_schema(&self) -> Value;

    async fn execute(&self, params: &Value, context: &SubagentContext) -> Result<SubagentOutput>;
}

/// Registry of subagents keyed by name, read far more often than written
/// (registration happens once at startup).
#[derive(Default)]
pub struct SubagentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Subagent>>>,
}

impl SubagentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Subagent>) {
        self.agents.write().unwrap().insert(agent.name().to_string(), agent);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Subagent>> {
        self.agents.read().unwrap().get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.agents.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().unwrap().contains_key(name)
    }
}

/// Deterministic stand-in subagent for tests: echoes its params back as the
/// output, optionally failing a fixed number of times before succeeding (to
/// exercise the parameter-repair retry path).
pub struct MockSubagent {
    name: String,
    fail_until_attempt: std::sync::atomic::AtomicU32,
}

impl MockSubagent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fail_until_attempt: std::sync::atomic::AtomicU32::new(0) }
    }

    /// Fail the first `attempts` calls, then succeed.
    #[must_use]
    pub fn failing_first(name: impl Into<String>, attempts: u32) -> Self {
        Self { name: name.into(), fail_until_attempt: std::sync::atomic::AtomicU32::new(attempts) }
    }
}

#[async_trait]
impl Subagent for MockSubagent {
    fn name(&self) -> &str {
        &self.name
    }

    fn param_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, params: &Value, _context: &SubagentContext) -> Result<SubagentOutput> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_until_attempt.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_until_attempt.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::StepExecution(format!("{} failed (retries remaining: {remaining})", self.name)));
        }
        Ok(SubagentOutput { output: params.clone(), artifacts: Vec::new() })
    }
}

/// A standard catalog of mock subagents (`rag_query`, `db_query`,
/// `report_gen`, `web_search`, `shell`) for exercising the planner and
/// orchestrator without wiring up real tool integrations.
#[must_use]
pub fn named_mock_catalog() -> Vec<Arc<dyn Subagent>> {
    ["rag_query", "db_query", "report_gen", "web_search", "shell"]
        .into_iter()
        .map(|name| Arc::new(MockSubagent::new(name)) as Arc<dyn Subagent>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_round_trips_agents() {
        let registry = SubagentRegistry::new();
        for agent in named_mock_catalog() {
            registry.register(agent);
        }
        assert!(registry.contains("rag_query"));
        assert_eq!(registry.names().len(), 5);
    }

    #[tokio::test]
    async fn mock_subagent_echoes_params() {
        let agent = MockSubagent::new("rag_query");
        let context = SubagentContext { session_id: Uuid::new_v4(), user_id: None, prior_outputs: HashMap::new() };
        let output = agent.execute(&serde_json::json!({"q": "x"}), &context).await.unwrap();
        assert_eq!(output.output, serde_json::json!({"q": "x"}));
    }

    #[tokio::test]
    async fn failing_first_mock_fails_then_succeeds() {
        let agent = MockSubagent::failing_first("db_query", 1);
        let context = SubagentContext { session_id: Uuid::new_v4(), user_id: None, prior_outputs: HashMap::new() };
        assert!(agent.execute(&serde_json::json!({}), &context).await.is_err());
        assert!(agent.execute(&serde_json::json!({}), &context).await.is_ok());
    }
}
