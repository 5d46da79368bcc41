//! Planner: turns a goal into an ordered list of subagent steps, with one
//! repair attempt on an invalid plan (spec §4.4.2 "Plan").

use super::subagent::SubagentRegistry;
use crate::error::{Error, Result};
use crate::llm::{CompletionParams, LanguageModel, Message};
use serde::{Deserialize, Serialize};

/// One step of a plan, as returned by the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent_name: String,
    pub params: serde_json::Value,
}

/// An ordered, validated sequence of subagent invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

#[must_use]
fn plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["steps"],
        "properties": {
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["agent_name", "params"],
                }
            }
        }
    })
}

/// Produces [`Plan`]s from a goal via a language model, validating every
/// step's `agent_name` against the [`SubagentRegistry`] and retrying once
/// with a repair prompt on an invalid plan.
pub struct Planner<L> {
    model: std::sync::Arc<L>,
}

impl<L: LanguageModel> Planner<L> {
    #[must_use]
    pub fn new(model: std::sync::Arc<L>) -> Self {
        Self { model }
    }

    pub async fn plan(&self, goal: &str, registry: &SubagentRegistry) -> Result<Plan> {
        let system = Message::system(format!(
            "Produce a JSON plan of subagent steps to accomplish the goal. \
             Available agents: {}. Each step is {{agent_name, params}}.",
            registry.names().join(", ")
        ));
        let messages = [system.clone(), Message::user(goal)];

        let raw = self.model.complete_json(&messages, &plan_schema(), &CompletionParams::default()).await?;
        let plan: Plan = serde_json::from_value(raw)?;

        if let Err(reason) = validate(&plan, registry) {
            let repair_messages = [
                system,
                Message::user(goal),
                Message::user(format!(
                    "That plan was invalid: {reason}. Reply again with only valid JSON \
                     using only the listed agents."
                )),
            ];
            let repaired_raw = self
                .model
                .complete_json(&repair_messages, &plan_schema(), &CompletionParams::default())
                .await?;
            let repaired: Plan = serde_json::from_value(repaired_raw)?;
            validate(&repaired, registry).map_err(Error::PlanValidation)?;
            return Ok(repaired);
        }

        Ok(plan)
    }
}

/// Every step's agent must exist in the registry and carry a params object.
fn validate(plan: &Plan, registry: &SubagentRegistry) -> std::result::Result<(), String> {
    if plan.steps.is_empty() {
        return Err("plan has no steps".to_string());
    }
    for step in &plan.steps {
        if !registry.contains(&step.agent_name) {
            return Err(format!("unknown agent: {}", step.agent_name));
        }
        if !step.params.is_object() {
            return Err(format!("params for {} must be an object", step.agent_name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLanguageModel;
    use crate::orchestrator::subagent::named_mock_catalog;

    fn registry() -> SubagentRegistry {
        let registry = SubagentRegistry::new();
        for agent in named_mock_catalog() {
            registry.register(agent);
        }
        registry
    }

    #[tokio::test]
    async fn valid_plan_passes_through() {
        let model = MockLanguageModel::constant(
            r#"{"steps": [{"agent_name": "rag_query", "params": {"q": "x"}}]}"#,
        );
        let planner = Planner::new(std::sync::Arc::new(model));
        let plan = planner.plan("find x", &registry()).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn unknown_agent_triggers_repair_then_succeeds() {
        let model = MockLanguageModel::scripted(vec![
            r#"{"steps": [{"agent_name": "nonexistent", "params": {}}]}"#.into(),
            r#"{"steps": [{"agent_name": "rag_query", "params": {}}]}"#.into(),
        ]);
        let planner = Planner::new(std::sync::Arc::new(model));
        let plan = planner.plan("find x", &registry()).await.unwrap();
        assert_eq!(plan.steps[0].agent_name, "rag_query");
    }

    #[tokio::test]
    async fn unknown_agent_after_repair_is_fatal() {
        let model = MockLanguageModel::scripted(vec![
            r#"{"steps": [{"agent_name": "nonexistent", "params": {}}]}"#.into(),
            r#"{"steps": [{"agent_name": "still_nonexistent", "params": {}}]}"#.into(),
        ]);
        let planner = Planner::new(std::sync::Arc::new(model));
        let result = planner.plan("find x", &registry()).await;
        assert!(matches!(result, Err(Error::PlanValidation(_))));
    }
}
