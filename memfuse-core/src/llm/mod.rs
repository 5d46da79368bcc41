//! Language model contract consumed by the Context Controller, Extractor,
//! and Orchestrator (spec §6): `complete` for free text, `completeJSON` for
//! schema-validated structured output with one repair pass on mismatch.

mod mock;

pub use mock::MockLanguageModel;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A single message in a chat-style completion request.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Sampling/limits shared by both completion modes.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self { temperature: 0.2, max_tokens: 1_024 }
    }
}

/// Trait for the injected language model provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-text completion.
    async fn complete(&self, messages: &[Message], params: &CompletionParams) -> Result<String>;

    /// Structured-JSON completion, validated against `schema`. On mismatch
    /// the default implementation asks the model to repair its own output
    /// once before surfacing [`Error::SchemaValidation`].
    async fn complete_json(
        &self,
        messages: &[Message],
        schema: &Value,
        params: &CompletionParams,
    ) -> Result<Value> {
        let raw = self.complete(messages, params).await?;
        if let Some(value) = try_parse_against_schema(&raw, schema) {
            return Ok(value);
        }

        let mut repair_messages = messages.to_vec();
        repair_messages.push(Message::assistant(raw));
        repair_messages.push(Message::user(format!(
            "That response did not match the required JSON schema: {schema}. \
             Reply again with only valid JSON matching the schema."
        )));
        let repaired = self.complete(&repair_messages, params).await?;
        try_parse_against_schema(&repaired, schema)
            .ok_or_else(|| Error::SchemaValidation(format!("response did not match schema: {schema}")))
    }
}

/// Best-effort schema check: valid JSON whose top-level required keys (if
/// `schema.required` is present) are all populated. A full JSON Schema
/// validator is out of scope for the core engine's mock/test surface.
fn try_parse_against_schema(raw: &str, schema: &Value) -> Option<Value> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let object = value.as_object()?;
        for key in required {
            let key = key.as_str()?;
            if !object.contains_key(key) {
                return None;
            }
        }
    }
    Some(value)
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self { role: self.role, content: self.content.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_mismatch_triggers_one_repair_then_fails() {
        let model = MockLanguageModel::scripted(vec!["not json".into(), "still not json".into()]);
        let schema = serde_json::json!({"required": ["steps"]});
        let result = model
            .complete_json(&[Message::user("plan")], &schema, &CompletionParams::default())
            .await;
        assert!(matches!(result, Err(Error::SchemaValidation(_))));
    }

    #[tokio::test]
    async fn schema_match_on_repair_succeeds() {
        let model = MockLanguageModel::scripted(vec![
            "not json".into(),
            r#"{"steps": []}"#.into(),
        ]);
        let schema = serde_json::json!({"required": ["steps"]});
        let result = model
            .complete_json(&[Message::user("plan")], &schema, &CompletionParams::default())
            .await
            .unwrap();
        assert_eq!(result["steps"], serde_json::json!([]));
    }
}
