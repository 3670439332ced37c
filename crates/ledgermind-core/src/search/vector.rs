//! Vector index over semantic artifacts.
//!
//! Vectors are L2-normalized on the way in and re-normalized on load, so
//! similarity is a plain dot product. Search runs the ANN index (feature
//! `vector-search`) over the portion indexed at the last save plus a
//! brute-force scan over the unindexed tail. Removal is a soft delete;
//! compaction triggers once soft-deleted rows exceed 20% of the store
//! (minimum 10). Persistence is three side-car files: raw vectors, doc
//! ids, and the ANN index, rebuilt on save.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

use crate::embeddings::{normalize, SharedEmbedder};

/// Query-embedding cache capacity
const EMBEDDING_CACHE_SIZE: usize = 500;

/// Auto-save once this many documents are added without a flush
const UNSAVED_FLUSH_THRESHOLD: usize = 500;

/// Minimum soft-deleted rows before compaction is considered
const COMPACT_MIN_DELETED: usize = 10;

/// Vector store error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VectorSearchError {
    /// Persistence failure
    #[error("Vector persistence failed: {0}")]
    Persistence(String),
    /// Embedding provider failure
    #[error(transparent)]
    Embedding(#[from] crate::embeddings::EmbeddingError),
    /// ANN index failure
    #[error("ANN index error: {0}")]
    Index(String),
    /// IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A document to index
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable opaque id (the artifact fid)
    pub id: String,
    /// Text to embed
    pub content: String,
}

/// One search hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Document id
    pub id: String,
    /// Cosine similarity
    pub score: f32,
}

/// Normalized dense-vector store with ANN plus brute-force tail scan
pub struct VectorStore {
    storage_path: PathBuf,
    embedder: Option<SharedEmbedder>,
    vectors: Vec<Vec<f32>>,
    doc_ids: Vec<String>,
    deleted_ids: HashSet<String>,
    dirty: bool,
    unsaved_count: usize,
    embedding_cache: LruCache<String, Vec<f32>>,
    #[cfg(feature = "vector-search")]
    ann: Option<usearch::Index>,
    /// Vectors covered by the ANN index; the tail beyond is brute-forced
    indexed_count: usize,
}

impl VectorStore {
    /// Create a store rooted at the given directory.
    ///
    /// Without an embedder the store still serves pre-computed vectors,
    /// but cannot encode queries: search degrades to empty results and the
    /// caller falls back to keyword search.
    pub fn new(storage_path: impl AsRef<Path>, embedder: Option<SharedEmbedder>) -> Self {
        Self {
            storage_path: storage_path.as_ref().to_path_buf(),
            embedder,
            vectors: Vec::new(),
            doc_ids: Vec::new(),
            deleted_ids: HashSet::new(),
            dirty: false,
            unsaved_count: 0,
            embedding_cache: LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_SIZE).expect("nonzero cache size"),
            ),
            #[cfg(feature = "vector-search")]
            ann: None,
            indexed_count: 0,
        }
    }

    /// Whether query encoding is available
    pub fn embedder_available(&self) -> bool {
        self.embedder.is_some()
    }

    /// Number of live (non-deleted) documents
    pub fn len(&self) -> usize {
        self.doc_ids.len() - self.deleted_ids.len()
    }

    /// Whether the store holds no live documents
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn vectors_path(&self) -> PathBuf {
        self.storage_path.join("vectors.bin")
    }

    fn meta_path(&self) -> PathBuf {
        self.storage_path.join("vector_meta.json")
    }

    #[cfg(feature = "vector-search")]
    fn ann_path(&self) -> PathBuf {
        self.storage_path.join("vectors.usearch")
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Load the side-car files, re-normalizing every vector.
    pub fn load(&mut self) {
        if !self.vectors_path().exists() || !self.meta_path().exists() {
            return;
        }
        match self.load_inner() {
            Ok(count) => {
                tracing::info!(vectors = count, "loaded vector store from disk");
            }
            Err(e) => {
                tracing::error!("failed to load vector store: {e}");
                self.vectors.clear();
                self.doc_ids.clear();
            }
        }
        #[cfg(feature = "vector-search")]
        self.load_ann();
    }

    fn load_inner(&mut self) -> Result<usize, VectorSearchError> {
        let mut raw = Vec::new();
        std::fs::File::open(self.vectors_path())?.read_to_end(&mut raw)?;
        if raw.len() < 8 {
            return Err(VectorSearchError::Persistence("truncated vectors.bin".into()));
        }
        let dims = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
        let expected = 8 + dims * count * 4;
        if dims == 0 || raw.len() < expected {
            return Err(VectorSearchError::Persistence(format!(
                "vectors.bin shape mismatch: {} bytes for {}x{}",
                raw.len(),
                count,
                dims
            )));
        }

        let mut vectors = Vec::with_capacity(count);
        for i in 0..count {
            let start = 8 + i * dims * 4;
            let mut v = Vec::with_capacity(dims);
            for j in 0..dims {
                let off = start + j * 4;
                v.push(f32::from_le_bytes(raw[off..off + 4].try_into().unwrap()));
            }
            // Re-normalize on load to keep dot products valid
            normalize(&mut v);
            vectors.push(v);
        }

        let meta_raw = std::fs::read_to_string(self.meta_path())?;
        let doc_ids: Vec<String> = serde_json::from_str(&meta_raw)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        if doc_ids.len() != vectors.len() {
            return Err(VectorSearchError::Persistence(format!(
                "doc id count {} does not match vector count {}",
                doc_ids.len(),
                vectors.len()
            )));
        }

        self.vectors = vectors;
        self.doc_ids = doc_ids;
        self.deleted_ids.clear();
        self.dirty = false;
        self.unsaved_count = 0;
        Ok(self.vectors.len())
    }

    #[cfg(feature = "vector-search")]
    fn load_ann(&mut self) {
        self.ann = None;
        self.indexed_count = 0;
        if self.vectors.is_empty() || !self.ann_path().exists() {
            return;
        }
        let dims = self.vectors[0].len();
        match Self::make_ann(dims) {
            Ok(index) => {
                let path = self.ann_path().to_string_lossy().into_owned();
                if index.load(&path).is_ok() {
                    self.indexed_count = (index.size() as usize).min(self.vectors.len());
                    self.ann = Some(index);
                    tracing::info!(items = self.indexed_count, "loaded ANN index");
                } else {
                    tracing::warn!("failed to load ANN index; relying on brute-force scan");
                }
            }
            Err(e) => tracing::warn!("failed to create ANN index: {e}"),
        }
    }

    #[cfg(feature = "vector-search")]
    fn make_ann(dims: usize) -> Result<usearch::Index, VectorSearchError> {
        let options = usearch::IndexOptions {
            dimensions: dims,
            metric: usearch::MetricKind::Cos,
            quantization: usearch::ScalarKind::F32,
            connectivity: 0,
            expansion_add: 0,
            expansion_search: 0,
            multi: false,
        };
        usearch::Index::new(&options).map_err(|e| VectorSearchError::Index(e.to_string()))
    }

    /// Flush vectors and doc ids to disk and rebuild the ANN index.
    pub fn save(&mut self) -> Result<(), VectorSearchError> {
        if !self.dirty {
            return Ok(());
        }
        std::fs::create_dir_all(&self.storage_path)?;

        let dims = self.vectors.first().map(|v| v.len()).unwrap_or(0);
        let mut raw = Vec::with_capacity(8 + self.vectors.len() * dims * 4);
        raw.extend_from_slice(&(dims as u32).to_le_bytes());
        raw.extend_from_slice(&(self.vectors.len() as u32).to_le_bytes());
        for v in &self.vectors {
            for x in v {
                raw.extend_from_slice(&x.to_le_bytes());
            }
        }
        std::fs::File::create(self.vectors_path())?.write_all(&raw)?;

        let meta = serde_json::to_string(&self.doc_ids)
            .map_err(|e| VectorSearchError::Persistence(e.to_string()))?;
        std::fs::write(self.meta_path(), meta)?;

        #[cfg(feature = "vector-search")]
        self.rebuild_ann();

        self.dirty = false;
        self.unsaved_count = 0;
        tracing::debug!("vector store flushed to disk");
        Ok(())
    }

    #[cfg(feature = "vector-search")]
    fn rebuild_ann(&mut self) {
        self.ann = None;
        self.indexed_count = 0;
        let Some(first) = self.vectors.first() else {
            let _ = std::fs::remove_file(self.ann_path());
            return;
        };
        match Self::make_ann(first.len()) {
            Ok(index) => {
                if index.reserve(self.vectors.len()).is_err() {
                    tracing::warn!("failed to reserve ANN capacity");
                    return;
                }
                for (i, v) in self.vectors.iter().enumerate() {
                    if let Err(e) = index.add(i as u64, v) {
                        tracing::warn!("ANN add failed at {i}: {e}");
                        return;
                    }
                }
                let path = self.ann_path().to_string_lossy().into_owned();
                if let Err(e) = index.save(&path) {
                    tracing::warn!("failed to persist ANN index: {e}");
                }
                self.indexed_count = self.vectors.len();
                self.ann = Some(index);
            }
            Err(e) => tracing::warn!("failed to build ANN index: {e}"),
        }
    }

    // ========================================================================
    // MUTATION
    // ========================================================================

    /// Embed a text through the LRU cache
    fn embed(&mut self, text: &str) -> Result<Vec<f32>, VectorSearchError> {
        if let Some(v) = self.embedding_cache.get(text) {
            return Ok(v.clone());
        }
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            VectorSearchError::Embedding(crate::embeddings::EmbeddingError::ModelInit(
                "no embedder configured".into(),
            ))
        })?;
        let mut vectors = embedder.encode(&[text])?;
        let mut v = vectors.pop().ok_or_else(|| {
            VectorSearchError::Embedding(crate::embeddings::EmbeddingError::EmbeddingFailed(
                "empty batch result".into(),
            ))
        })?;
        normalize(&mut v);
        self.embedding_cache.put(text.to_string(), v.clone());
        Ok(v)
    }

    /// Encode a query without touching the store (for similarity checks)
    pub fn encode_query(&mut self, text: &str) -> Result<Vec<f32>, VectorSearchError> {
        self.embed(text)
    }

    /// Add documents, encoding them unless embeddings are supplied.
    ///
    /// A dimension mismatch against the existing matrix resets the index
    /// rather than corrupting it.
    pub fn add_documents(
        &mut self,
        documents: &[Document],
        embeddings: Option<Vec<Vec<f32>>>,
    ) -> Result<(), VectorSearchError> {
        if documents.is_empty() {
            return Ok(());
        }

        let mut new_vectors = match embeddings {
            Some(vs) => {
                if vs.len() != documents.len() {
                    return Err(VectorSearchError::Embedding(
                        crate::embeddings::EmbeddingError::InvalidInput(format!(
                            "{} embeddings for {} documents",
                            vs.len(),
                            documents.len()
                        )),
                    ));
                }
                vs
            }
            None => {
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    VectorSearchError::Embedding(crate::embeddings::EmbeddingError::ModelInit(
                        "no embedder configured".into(),
                    ))
                })?;
                let texts: Vec<&str> = documents.iter().map(|d| d.content.as_str()).collect();
                embedder.encode(&texts)?
            }
        };

        for v in &mut new_vectors {
            normalize(v);
        }

        if let (Some(existing), Some(incoming)) = (self.vectors.first(), new_vectors.first()) {
            if existing.len() != incoming.len() {
                tracing::warn!(
                    existing = existing.len(),
                    incoming = incoming.len(),
                    "vector dimension mismatch; resetting index"
                );
                self.vectors.clear();
                self.doc_ids.clear();
                self.deleted_ids.clear();
                self.indexed_count = 0;
                #[cfg(feature = "vector-search")]
                {
                    self.ann = None;
                }
                self.dirty = true;
            }
        }

        // A re-added id stops being deleted
        for doc in documents {
            self.deleted_ids.remove(&doc.id);
        }

        self.vectors.extend(new_vectors);
        self.doc_ids.extend(documents.iter().map(|d| d.id.clone()));
        self.dirty = true;
        self.unsaved_count += documents.len();

        if self.unsaved_count >= UNSAVED_FLUSH_THRESHOLD {
            self.save()?;
        }
        Ok(())
    }

    /// Soft-delete a document; compacts once the deleted share passes 20%.
    pub fn remove_id(&mut self, fid: &str) {
        if self.doc_ids.iter().any(|id| id == fid) {
            self.deleted_ids.insert(fid.to_string());
            tracing::info!(fid, "marked vector as deleted (soft delete)");
            if self.deleted_ids.len() > COMPACT_MIN_DELETED.max(self.doc_ids.len() / 5) {
                if let Err(e) = self.compact() {
                    tracing::error!("vector compaction failed: {e}");
                }
            }
        }
    }

    /// Physically drop soft-deleted vectors and rebuild the index.
    pub fn compact(&mut self) -> Result<(), VectorSearchError> {
        if self.deleted_ids.is_empty() {
            return Ok(());
        }
        tracing::info!(
            removing = self.deleted_ids.len(),
            "compacting vector store"
        );

        let mut kept_vectors = Vec::with_capacity(self.vectors.len());
        let mut kept_ids = Vec::with_capacity(self.doc_ids.len());
        for (v, id) in self.vectors.drain(..).zip(self.doc_ids.drain(..)) {
            if !self.deleted_ids.contains(&id) {
                kept_vectors.push(v);
                kept_ids.push(id);
            }
        }
        self.vectors = kept_vectors;
        self.doc_ids = kept_ids;
        self.deleted_ids.clear();
        self.dirty = true;

        if self.vectors.is_empty() {
            let _ = std::fs::remove_file(self.vectors_path());
            let _ = std::fs::remove_file(self.meta_path());
            #[cfg(feature = "vector-search")]
            {
                let _ = std::fs::remove_file(self.ann_path());
                self.ann = None;
            }
            self.indexed_count = 0;
            self.dirty = false;
            self.unsaved_count = 0;
            return Ok(());
        }
        self.save()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// The stored vector for a document, unless deleted
    pub fn get_vector(&self, fid: &str) -> Option<&[f32]> {
        if self.deleted_ids.contains(fid) {
            return None;
        }
        let idx = self.doc_ids.iter().position(|id| id == fid)?;
        self.vectors.get(idx).map(|v| v.as_slice())
    }

    /// Search by text query: ANN over the indexed prefix plus a
    /// brute-force dot-product scan over the unindexed tail.
    pub fn search(&mut self, query: &str, limit: usize) -> Vec<VectorHit> {
        if self.vectors.is_empty() || self.embedder.is_none() {
            return vec![];
        }
        let query_vector = match self.embed(query) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("query embedding failed: {e}");
                return vec![];
            }
        };
        if self.vectors[0].len() != query_vector.len() {
            tracing::warn!(
                index = self.vectors[0].len(),
                query = query_vector.len(),
                "search dimension mismatch; skipping vector search"
            );
            return vec![];
        }

        let mut results: Vec<VectorHit> = Vec::new();
        let mut ann_covered = 0usize;

        #[cfg(feature = "vector-search")]
        if let Some(ann) = &self.ann {
            // Over-fetch to buffer against soft-deleted rows
            let ann_limit = limit * 2 + 10;
            match ann.search(&query_vector, ann_limit) {
                Ok(matches) => {
                    for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
                        let idx = *key as usize;
                        if idx >= self.doc_ids.len() {
                            continue;
                        }
                        let fid = &self.doc_ids[idx];
                        if self.deleted_ids.contains(fid) {
                            continue;
                        }
                        results.push(VectorHit {
                            id: fid.clone(),
                            score: 1.0 - distance,
                        });
                    }
                    ann_covered = self.indexed_count;
                }
                Err(e) => {
                    tracing::error!("ANN search failed: {e}; falling back to full scan");
                    results.clear();
                }
            }
        }

        // Brute-force scan over everything the ANN index has not seen
        for idx in ann_covered..self.vectors.len() {
            let fid = &self.doc_ids[idx];
            if self.deleted_ids.contains(fid) {
                continue;
            }
            let score: f32 = self.vectors[idx]
                .iter()
                .zip(query_vector.iter())
                .map(|(a, b)| a * b)
                .sum();
            results.push(VectorHit {
                id: fid.clone(),
                score,
            });
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        // Re-added ids can appear twice (old row plus new); keep the best
        let mut seen = HashSet::new();
        results.retain(|h| seen.insert(h.id.clone()));
        results.truncate(limit);
        results
    }
}
