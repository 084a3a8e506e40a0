//! 휴리스틱 추출기 (네트워크 호출 없음)
//!
//! 대문자로 시작하는 토큰, @핸들, #해시태그, 숫자가 섞인 토큰을 엔티티로 보고
//! 인접한 엔티티끼리 `co_occurs` 관계를 만듭니다.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{Extraction, InfoExtractor, Triple};
use crate::error::Result;

const CO_OCCURS: &str = "co_occurs";

const STOPWORDS: &[&str] = &[
    "and", "or", "but", "the", "a", "an", "of", "in", "on", "for", "to", "with", "is", "are",
    "was", "were", "this", "that", "what", "which", "who", "how", "when", "where", "it",
];

/// 휴리스틱 엔티티/관계 추출기
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    stopwords: HashSet<String>,
    min_token_len: usize,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        Self {
            stopwords: STOPWORDS.iter().map(|w| w.to_string()).collect(),
            min_token_len: 3,
        }
    }

    fn is_candidate(&self, token: &str) -> bool {
        if token.chars().count() < self.min_token_len {
            return false;
        }
        if self.stopwords.contains(&token.to_lowercase()) {
            return false;
        }

        token.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
            || token.starts_with('@')
            || token.starts_with('#')
            || token.chars().any(|c| c.is_numeric())
    }

    /// 동기 추출 (테스트와 async 래퍼에서 공용)
    pub fn extract_sync(&self, text: &str) -> Extraction {
        let mut seen = HashSet::new();
        let mut entities = Vec::new();

        for raw in text.split_whitespace() {
            let token = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '#');
            if !self.is_candidate(token) {
                continue;
            }
            if seen.insert(token.to_lowercase()) {
                entities.push(token.to_string());
            }
        }

        let triples = entities
            .windows(2)
            .map(|pair| Triple::new(pair[0].clone(), CO_OCCURS, pair[1].clone()))
            .collect();

        Extraction { entities, triples }
    }
}

#[async_trait]
impl InfoExtractor for HeuristicExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        Ok(self.extract_sync(text))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_entities_and_relations() {
        let extractor = HeuristicExtractor::new();
        let result = extractor.extract_sync("Alice met Bob in Paris with @carol.");

        assert_eq!(result.entities, vec!["Alice", "Bob", "Paris", "@carol"]);
        assert_eq!(result.triples.len(), 3);
        assert_eq!(result.triples[0].subject, "Alice");
        assert_eq!(result.triples[0].predicate, "co_occurs");
        assert_eq!(result.triples[0].object, "Bob");
    }

    #[test]
    fn test_skips_stopwords_and_duplicates() {
        let extractor = HeuristicExtractor::new();
        let result = extractor.extract_sync("The Rust book. The rust compiler, Rust 2021");

        // "The"는 불용어, "Rust"/"rust"는 하나로
        assert_eq!(result.entities, vec!["Rust", "2021"]);
    }

    #[tokio::test]
    async fn test_async_extract_empty_text() {
        let extractor = HeuristicExtractor::new();
        let result = extractor.extract("  ").await.unwrap();
        assert!(result.entities.is_empty());
        assert!(result.triples.is_empty());
        assert_eq!(extractor.name(), "heuristic");
    }
}
