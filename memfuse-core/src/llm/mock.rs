//! Deterministic mock language model for tests.

use super::{CompletionParams, LanguageModel, Message};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Replays a fixed script of responses, one per call, then repeats the last
/// entry forever. Useful for exercising the repair-pass path deterministically.
pub struct MockLanguageModel {
    script: Mutex<Vec<String>>,
    calls: Mutex<usize>,
}

impl MockLanguageModel {
    #[must_use]
    pub fn scripted(script: Vec<String>) -> Self {
        Self { script: Mutex::new(script), calls: Mutex::new(0) }
    }

    /// Always returns the same response.
    #[must_use]
    pub fn constant(response: impl Into<String>) -> Self {
        Self::scripted(vec![response.into()])
    }

    /// Number of `complete` calls observed so far.
    pub async fn call_count(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, _messages: &[Message], _params: &CompletionParams) -> Result<String> {
        let mut calls = self.calls.lock().await;
        let script = self.script.lock().await;
        let index = (*calls).min(script.len().saturating_sub(1));
        *calls += 1;
        Ok(script.get(index).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_holds_last_entry() {
        let model = MockLanguageModel::scripted(vec!["a".into(), "b".into()]);
        let params = CompletionParams::default();
        assert_eq!(model.complete(&[], &params).await.unwrap(), "a");
        assert_eq!(model.complete(&[], &params).await.unwrap(), "b");
        assert_eq!(model.complete(&[], &params).await.unwrap(), "b");
    }
}
