//! Vector/semantic search seam and a token-overlap implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::inference::Result;

/// One ranked document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredMatch {
    /// Position of the document in the ranked input
    pub index: usize,
    /// Confidence in `[0, 1]`
    pub score: f64,
}

/// Ranks candidate documents against a query.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    fn name(&self) -> &str;

    /// Score every document; results are sorted by descending score.
    async fn rank(&self, query: &str, documents: &[String]) -> Result<Vec<ScoredMatch>>;
}

/// Jaccard similarity over lowercase word tokens.
#[derive(Debug, Default, Clone)]
pub struct KeywordSearch;

impl KeywordSearch {
    pub fn new() -> Self {
        Self
    }

    pub fn similarity(a: &str, b: &str) -> f64 {
        let a = tokens(a);
        let b = tokens(b);
        if a.is_empty() && b.is_empty() {
            return 0.0;
        }
        let shared = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        shared / union
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl VectorSearch for KeywordSearch {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn rank(&self, query: &str, documents: &[String]) -> Result<Vec<ScoredMatch>> {
        let mut matches: Vec<ScoredMatch> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| ScoredMatch {
                index,
                score: Self::similarity(query, doc),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rank_orders_by_overlap() {
        let search = KeywordSearch::new();
        let docs = vec![
            "city skyline at night".to_string(),
            "misty forest at dawn with deer".to_string(),
            "forest clearing".to_string(),
        ];
        let ranked = search.rank("dawn in a misty forest", &docs).await.unwrap();
        assert_eq!(ranked[0].index, 1);
        assert!(ranked[0].score > ranked[1].score);
        assert!(ranked.iter().all(|m| (0.0..=1.0).contains(&m.score)));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(KeywordSearch::similarity("same words", "same words"), 1.0);
        assert_eq!(KeywordSearch::similarity("", ""), 0.0);
        assert_eq!(KeywordSearch::similarity("alpha", "beta"), 0.0);
    }
}
