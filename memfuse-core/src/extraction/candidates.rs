//! Parsing and MECE clustering of raw candidate JSON from the language
//! model's structured-JSON extraction call (spec §4.3 steps 2-3, "MECE
//! principle").

use crate::types::FactType;

/// One candidate item proposed by the language model, before dedup.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub fact_type: FactType,
    pub content: String,
    pub confidence: f64,
    pub contradicts_hint: bool,
}

/// Best-effort parse of the `{"candidates": [...]}` payload; entries that
/// don't carry a recognizable `type`/`content` pair are silently skipped
/// rather than failing the whole batch.
pub fn parse(raw: &serde_json::Value) -> Vec<Candidate> {
    let Some(items) = raw.get("candidates").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let fact_type = parse_fact_type(item.get("type")?.as_str()?)?;
            let content = item.get("content")?.as_str()?.to_string();
            let confidence = item.get("confidence").and_then(serde_json::Value::as_f64).unwrap_or(0.5);
            let contradicts_hint = item
                .get("contradicts_hint")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            Some(Candidate { fact_type, content, confidence, contradicts_hint })
        })
        .collect()
}

fn parse_fact_type(raw: &str) -> Option<FactType> {
    match raw.to_lowercase().as_str() {
        "fact" => Some(FactType::Fact),
        "decision" => Some(FactType::Decision),
        "assumption" => Some(FactType::Assumption),
        "user_preference" | "userpreference" => Some(FactType::UserPreference),
        _ => None,
    }
}

/// Within one batch, candidates with identical `(type, content)` are the
/// same cluster; only the highest-confidence representative survives
/// (spec §4.3 "MECE principle").
#[must_use]
pub fn mece_cluster(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_key: std::collections::HashMap<(FactType, String), Candidate> = std::collections::HashMap::new();

    for candidate in candidates {
        let key = (candidate.fact_type, candidate.content.clone());
        by_key
            .entry(key)
            .and_modify(|existing| {
                if candidate.confidence > existing.confidence {
                    *existing = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    by_key.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_candidates() {
        let raw = serde_json::json!({
            "candidates": [
                {"type": "decision", "content": "Ship Monday", "confidence": 0.9},
                {"type": "unknown_type", "content": "skipped"},
            ]
        });
        let parsed = parse(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].fact_type, FactType::Decision);
    }

    #[test]
    fn mece_cluster_keeps_highest_confidence_duplicate() {
        let candidates = vec![
            Candidate { fact_type: FactType::Fact, content: "same".into(), confidence: 0.3, contradicts_hint: false },
            Candidate { fact_type: FactType::Fact, content: "same".into(), confidence: 0.8, contradicts_hint: false },
        ];
        let clustered = mece_cluster(candidates);
        assert_eq!(clustered.len(), 1);
        assert_eq!(clustered[0].confidence, 0.8);
    }
}
