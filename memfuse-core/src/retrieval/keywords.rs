//! Stopword-filtered keyword extraction for the fact keyword-match stream
//! (spec §4.2).

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "did", "do", "does", "for", "from",
    "had", "has", "have", "how", "in", "into", "is", "it", "its", "of", "on", "or", "our", "so",
    "that", "the", "their", "them", "then", "there", "these", "this", "to", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "will", "with", "why", "you", "your",
];

/// Lowercases, strips punctuation, and drops stopwords and empty tokens.
#[must_use]
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .filter(|token| !STOPWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_stopwords_and_punctuation() {
        let tokens = extract_keywords("Why did we choose Plan B?");
        assert_eq!(tokens, vec!["why", "we", "choose", "plan", "b"]);
    }

    #[test]
    fn empty_query_yields_no_tokens() {
        assert!(extract_keywords("   ").is_empty());
    }
}
