//! Local semantic embeddings via fastembed ONNX inference.

use std::sync::{Mutex, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{EmbeddingError, TextEmbedder};

/// Output dimensionality of the default model
pub const LOCAL_EMBEDDING_DIMENSIONS: usize = 384;

/// Maximum text length fed to the model (truncated beyond)
const MAX_TEXT_LENGTH: usize = 8192;

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

/// Cache directory for downloaded model files.
///
/// Respects `FASTEMBED_CACHE_PATH`, then the platform cache directory.
fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "ledgermind", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

fn model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = MODEL.get_or_init(|| {
        let cache = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!("failed to create model cache dir {:?}: {e}", cache);
        }
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false)
            .with_cache_dir(cache);
        TextEmbedding::try_new(options).map(Mutex::new).map_err(|e| {
            format!(
                "Failed to initialize embedding model: {e}. \
                 Ensure ONNX runtime is available and model files can be downloaded."
            )
        })
    });
    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("Lock poisoned: {e}"))),
        Err(err) => Err(EmbeddingError::ModelInit(err.clone())),
    }
}

/// Local ONNX embedder
pub struct LocalEmbedder;

impl LocalEmbedder {
    /// Construct the embedder; the model loads lazily on first encode.
    pub fn new() -> Self {
        Self
    }

    /// Eagerly initialize the model, surfacing load failures early
    pub fn warm_up() -> Result<(), EmbeddingError> {
        model().map(|_| ())
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl TextEmbedder for LocalEmbedder {
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let truncated: Vec<&str> = texts
            .iter()
            .map(|t| {
                if t.len() > MAX_TEXT_LENGTH {
                    let mut end = MAX_TEXT_LENGTH;
                    while end > 0 && !t.is_char_boundary(end) {
                        end -= 1;
                    }
                    &t[..end]
                } else {
                    *t
                }
            })
            .collect();
        let mut guard = model()?;
        guard
            .embed(truncated, None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }

    fn dimensions(&self) -> usize {
        LOCAL_EMBEDDING_DIMENSIONS
    }

    fn name(&self) -> &str {
        "fastembed-all-minilm-l6-v2"
    }
}
