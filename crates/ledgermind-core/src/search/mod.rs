//! Hybrid retrieval - rank fusion and the vector index.

pub mod vector;

pub use vector::{Document, VectorHit, VectorStore, VectorSearchError};

use std::collections::HashMap;

/// RRF fusion constant
pub const RRF_K: f32 = 60.0;

/// Reciprocal Rank Fusion over two ranked lists.
///
/// `score(d) = sum of 1/(k + rank(d) + 1)` across the lists. RRF
/// normalizes across different scoring scales and rewards items appearing
/// in both lists; k dampens the effect of high ranks.
pub fn reciprocal_rank_fusion(
    vector_results: &[(String, f32)],
    keyword_results: &[(String, f32)],
    k: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, (key, _)) in vector_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32 + 1.0);
    }
    for (rank, (key, _)) in keyword_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32 + 1.0);
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

/// Upper bound of a two-list RRF score before normalization
pub fn rrf_max(k: f32) -> f32 {
    2.0 / (k + 1.0)
}
