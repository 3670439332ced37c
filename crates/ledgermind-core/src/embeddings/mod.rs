//! Embedding providers.
//!
//! The engine talks to a [`TextEmbedder`]; the vector store owns caching
//! and normalization. The default local provider (feature `embeddings`)
//! runs ONNX inference via fastembed; the deterministic hashing embedder
//! serves tests and degraded environments.

mod hashing;
#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
mod local;

pub use hashing::HashingEmbedder;
#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;

use std::sync::Arc;

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Failed to initialize the embedding model
    #[error("Model initialization failed: {0}")]
    ModelInit(String),
    /// Failed to generate an embedding
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Invalid input (empty, wrong shape)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

// ============================================================================
// PROVIDER CONTRACT
// ============================================================================

/// A dense-vector text encoder
pub trait TextEmbedder: Send + Sync {
    /// Encode a batch of texts into vectors of `dimensions()` floats
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Output dimensionality
    fn dimensions(&self) -> usize;

    /// Provider name for diagnostics
    fn name(&self) -> &str;
}

/// Shared handle to an embedder
pub type SharedEmbedder = Arc<dyn TextEmbedder>;

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors; 0.0 on shape mismatch
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Normalize a vector to unit length in place
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Whether a vector is unit length within tolerance
pub fn is_normalized(vector: &[f32]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    (norm - 1.0).abs() < 1e-3
}
