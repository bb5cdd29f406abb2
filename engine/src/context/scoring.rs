//! Relevance scoring
//!
//! Both the fractal index and the flat fallback rank text against the
//! current prompt through [`RelevanceScorer`]. The default keyword-overlap
//! scorer can be swapped for an embedding-similarity implementation without
//! touching either caller.

use std::collections::HashSet;

/// Scores how relevant `text` is to `query`
///
/// Implementations must be deterministic; higher is more relevant.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, text: &str, query: &str) -> f64;
}

/// Normalized keyword overlap: shared query terms / distinct query terms
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordOverlapScorer;

impl RelevanceScorer for KeywordOverlapScorer {
    fn score(&self, text: &str, query: &str) -> f64 {
        let query_terms: HashSet<String> = terms(query).collect();
        if query_terms.is_empty() {
            return 0.0;
        }
        let text_terms: HashSet<String> = terms(text).collect();
        let shared = query_terms.intersection(&text_terms).count();
        shared as f64 / query_terms.len() as f64
    }
}

/// Lowercase alphanumeric terms of at least two characters
pub fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
}
