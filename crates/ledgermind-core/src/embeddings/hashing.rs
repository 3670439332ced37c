//! Deterministic token-bucket embedder.
//!
//! Hashes tokens into a fixed number of buckets and normalizes the counts.
//! Not semantically meaningful, but texts sharing tokens score high, which
//! is what tests and degraded environments need. Never use it where real
//! semantic search matters.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{normalize, EmbeddingError, TextEmbedder};

/// Default dimensionality of the hashing embedder
pub const HASHING_DIMENSIONS: usize = 384;

/// Deterministic bag-of-tokens embedder
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIMENSIONS)
    }
}

impl HashingEmbedder {
    /// Create an embedder with the given output dimensionality
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimensions as u64) as usize;
            // Sign split halves the collision damage
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

impl TextEmbedder for HashingEmbedder {
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing-bow"
    }
}
