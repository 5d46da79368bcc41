//! Context Controller: assembles the final model-facing prompt from the
//! system preamble, recalled memory, conversation history, and the user's
//! query under the three token budgets (spec §4.1).

use crate::config::MemFuseConfig;
use crate::retrieval::RecalledItem;
use crate::types::{Speaker, Turn};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base ranks are bundled"))
}

/// Token count for a piece of text under the deterministic `cl100k_base`
/// encoding, used for every budget decision in this module.
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    tokenizer().encode_with_special_tokens(text).len()
}

/// Inputs to a single [`ContextController::compose`] call.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    pub system_prompt: String,
    pub user_query: String,
    /// Newest-first.
    pub history: Vec<Turn>,
    /// Already fused and ranked by the Retriever, descending score.
    pub recalled: Vec<RecalledItem>,
}

/// The assembled prompt, plus the decisions made while trimming it, kept for
/// observability and for tests that assert on truncation behavior.
#[derive(Debug, Clone)]
pub struct ComposedContext {
    pub prompt: String,
    pub turns_included: usize,
    pub turns_dropped: usize,
    pub recall_items_included: usize,
    pub recall_items_dropped: usize,
    pub query_truncated: bool,
}

/// Builds prompts under the three spec §4.1 token budgets. Stateless; holds
/// only the resolved configuration.
pub struct ContextController {
    config: MemFuseConfig,
}

impl ContextController {
    #[must_use]
    pub fn new(config: MemFuseConfig) -> Self {
        Self { config }
    }

    /// Compose a prompt. The system prompt and (possibly truncated) user
    /// query always survive; history and recall are trimmed first, in that
    /// order, to make room.
    #[must_use]
    pub fn compose(&self, request: &ComposeRequest) -> ComposedContext {
        let system_tokens = count_tokens(&request.system_prompt);

        let (query, query_truncated) =
            truncate_suffix_preserving(&request.user_query, self.config.user_input_max_tokens);
        let query_tokens = count_tokens(&query);

        let reserved = system_tokens + query_tokens;
        let remaining_total = self.config.total_context_max_tokens.saturating_sub(reserved);

        let history_budget = self.config.history_max_tokens.min(remaining_total);
        let (history_section, turns_included, turns_dropped) =
            select_history(&request.history, history_budget);
        let history_tokens = count_tokens(&history_section);

        let recall_budget = remaining_total.saturating_sub(history_tokens);
        let (recall_section, recall_items_included, recall_items_dropped) =
            select_recall(&request.recalled, recall_budget);

        let mut prompt = String::new();
        prompt.push_str(&request.system_prompt);
        if !history_section.is_empty() {
            prompt.push_str("\n\n# Conversation history\n");
            prompt.push_str(&history_section);
        }
        if !recall_section.is_empty() {
            prompt.push_str("\n\n# Relevant memory\n");
            prompt.push_str(&recall_section);
        }
        prompt.push_str("\n\n# User\n");
        prompt.push_str(&query);

        ComposedContext {
            prompt,
            turns_included,
            turns_dropped,
            recall_items_included,
            recall_items_dropped,
            query_truncated,
        }
    }
}

/// Truncates `text` to at most `max_tokens`, keeping the trailing tokens
/// (the end of a query is usually where the actual ask lives).
fn truncate_suffix_preserving(text: &str, max_tokens: usize) -> (String, bool) {
    let tokens = tokenizer().encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return (text.to_string(), false);
    }
    let kept = &tokens[tokens.len() - max_tokens..];
    let decoded = tokenizer().decode(kept.to_vec()).unwrap_or_default();
    (decoded, true)
}

/// Newest-first turns are added whole until the next one would overflow the
/// budget; a turn that alone exceeds the budget is dropped rather than
/// split, per spec §4.1.
fn select_history(history: &[Turn], budget: usize) -> (String, usize, usize) {
    let mut used = 0usize;
    let mut included = Vec::new();

    for turn in history {
        let line = format_turn(turn);
        let tokens = count_tokens(&line);
        if tokens > budget {
            continue;
        }
        if used + tokens > budget {
            break;
        }
        used += tokens;
        included.push(line);
    }

    let turns_included = included.len();
    let turns_dropped = history.len() - turns_included;
    // Restore chronological order for the final prompt.
    included.reverse();
    (included.join("\n"), turns_included, turns_dropped)
}

fn format_turn(turn: &Turn) -> String {
    let speaker = match turn.speaker {
        Speaker::User => "User",
        Speaker::Assistant => "Assistant",
    };
    format!("{speaker}: {}", turn.content)
}

/// Recall items are already ranked by descending score; included in that
/// order until the budget is exhausted, then the remainder is dropped
/// (tail-trimmed), never re-ordered.
fn select_recall(items: &[RecalledItem], budget: usize) -> (String, usize, usize) {
    let mut used = 0usize;
    let mut lines = Vec::new();

    for item in items {
        let line = format!("- {}", item.content);
        let tokens = count_tokens(&line);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        lines.push(line);
    }

    let included = lines.len();
    let dropped = items.len() - included;
    (lines.join("\n"), included, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RecallKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn turn(content: &str) -> Turn {
        Turn {
            session_id: Uuid::new_v4(),
            round_id: 0,
            speaker: Speaker::User,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn recalled(content: &str, score: f32) -> RecalledItem {
        RecalledItem {
            kind: RecallKind::Chunk,
            content: content.to_string(),
            score,
            origin: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn controller(config: MemFuseConfig) -> ContextController {
        ContextController::new(config)
    }

    #[test]
    fn empty_history_and_recall_still_composes() {
        let controller = controller(MemFuseConfig::default());
        let request = ComposeRequest {
            system_prompt: "You are an assistant.".into(),
            user_query: "hello".into(),
            history: vec![],
            recalled: vec![],
        };
        let composed = controller.compose(&request);
        assert!(composed.prompt.contains("hello"));
        assert_eq!(composed.turns_included, 0);
        assert_eq!(composed.recall_items_included, 0);
    }

    #[test]
    fn oversize_single_turn_is_dropped_whole() {
        let mut config = MemFuseConfig::default();
        config.history_max_tokens = 5;
        let controller = controller(config);
        let huge_turn = turn(&"word ".repeat(500));
        let request = ComposeRequest {
            system_prompt: "sys".into(),
            user_query: "q".into(),
            history: vec![huge_turn],
            recalled: vec![],
        };
        let composed = controller.compose(&request);
        assert_eq!(composed.turns_included, 0);
        assert_eq!(composed.turns_dropped, 1);
    }

    #[test]
    fn query_exceeding_its_own_budget_is_truncated() {
        let mut config = MemFuseConfig::default();
        config.user_input_max_tokens = 3;
        let controller = controller(config);
        let request = ComposeRequest {
            system_prompt: "sys".into(),
            user_query: "one two three four five six seven".into(),
            history: vec![],
            recalled: vec![],
        };
        let composed = controller.compose(&request);
        assert!(composed.query_truncated);
        assert!(composed.prompt.contains("seven"));
    }

    #[test]
    fn recall_list_larger_than_budget_is_tail_trimmed() {
        let mut config = MemFuseConfig::default();
        config.total_context_max_tokens = 40;
        config.history_max_tokens = 0;
        let controller = controller(config);
        let items = vec![recalled("first high score item", 0.9), recalled("second lower score item that is much longer than the first one by quite a lot of words", 0.5)];
        let request = ComposeRequest {
            system_prompt: "sys".into(),
            user_query: "q".into(),
            history: vec![],
            recalled: items,
        };
        let composed = controller.compose(&request);
        assert_eq!(composed.recall_items_included, 1);
        assert_eq!(composed.recall_items_dropped, 1);
        assert!(composed.prompt.contains("first high score item"));
    }

    #[test]
    fn system_prompt_and_query_survive_extreme_trimming() {
        let mut config = MemFuseConfig::default();
        config.total_context_max_tokens = 1;
        config.history_max_tokens = 0;
        let controller = controller(config);
        let request = ComposeRequest {
            system_prompt: "sys".into(),
            user_query: "q".into(),
            history: vec![turn("irrelevant")],
            recalled: vec![recalled("irrelevant", 1.0)],
        };
        let composed = controller.compose(&request);
        assert!(composed.prompt.contains("sys"));
        assert!(composed.prompt.contains('q'));
    }
}
