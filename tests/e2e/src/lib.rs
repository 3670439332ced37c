//! Shared harness for the end-to-end conformance tests.

use std::path::Path;
use std::sync::Arc;

use ledgermind_core::{HashingEmbedder, Memory, MemoryConfig};

/// Open an engine rooted at the given directory with the deterministic
/// hashing embedder, so similarity behavior is reproducible without model
/// downloads.
pub fn open_memory(dir: &Path) -> Memory {
    open_memory_with(dir, MemoryConfig::default())
}

/// Open an engine with a customized configuration (storage path is always
/// overridden to the test directory).
pub fn open_memory_with(dir: &Path, mut config: MemoryConfig) -> Memory {
    config.storage_path = Some(dir.to_path_buf());
    Memory::open_with_embedder(config, Some(Arc::new(HashingEmbedder::default())))
        .expect("failed to open memory engine")
}
