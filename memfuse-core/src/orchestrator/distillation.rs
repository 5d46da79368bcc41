//! Workflow distillation: turns a successful plan execution into a reusable
//! template stored in M3 (spec §4.4.3).

use super::planner::Plan;
use crate::retrieval::extract_keywords;
use crate::types::{Workflow, WorkflowStep};
use std::collections::HashMap;
use uuid::Uuid;

/// Replaces concrete step outputs referenced by name with slot placeholders
/// so the template generalizes across goals of the same shape.
#[must_use]
pub fn templatize(plan: &Plan, prior_outputs: &HashMap<String, serde_json::Value>) -> Vec<WorkflowStep> {
    plan.steps
        .iter()
        .map(|step| WorkflowStep {
            agent: step.agent_name.clone(),
            params_template: slotify(&step.params, prior_outputs),
        })
        .collect()
}

fn slotify(value: &serde_json::Value, prior_outputs: &HashMap<String, serde_json::Value>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            if let Some((slot, _)) = prior_outputs.iter().find(|(_, v)| v.as_str() == Some(s.as_str())) {
                serde_json::json!(format!("{{{{{slot}}}}}"))
            } else {
                value.clone()
            }
        }
        serde_json::Value::Object(map) => {
            let slotted: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), slotify(v, prior_outputs)))
                .collect();
            serde_json::Value::Object(slotted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| slotify(v, prior_outputs)).collect())
        }
        other => other.clone(),
    }
}

/// Builds the [`Workflow`] row to upsert after a successful execution.
#[must_use]
pub fn distill(goal: &str, goal_embedding: Vec<f32>, steps: Vec<WorkflowStep>) -> Workflow {
    let keywords = extract_keywords(goal);
    let trigger_pattern = if keywords.is_empty() { None } else { Some(keywords.join(" ")) };
    let now = chrono::Utc::now();

    Workflow {
        workflow_id: Uuid::new_v4(),
        trigger_embedding: goal_embedding,
        trigger_pattern,
        successful_workflow: steps,
        usage_count: 1,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::planner::PlanStep;

    #[test]
    fn templatize_replaces_prior_output_references() {
        let plan = Plan {
            steps: vec![
                PlanStep { agent_name: "rag_query".into(), params: serde_json::json!({"q": "goal"}) },
                PlanStep { agent_name: "report_gen".into(), params: serde_json::json!({"text": "step1 result"}) },
            ],
        };
        let mut prior_outputs = HashMap::new();
        prior_outputs.insert("step1".to_string(), serde_json::json!("step1 result"));

        let templated = templatize(&plan, &prior_outputs);
        assert_eq!(templated[1].params_template["text"], serde_json::json!("{{step1}}"));
    }

    #[test]
    fn distill_sets_trigger_pattern_from_keywords() {
        let workflow = distill("Summarize last quarter's sales report", vec![0.0; 4], Vec::new());
        assert!(workflow.trigger_pattern.unwrap().contains("summarize"));
        assert_eq!(workflow.usage_count, 1);
    }
}
