//! Crate-wide error taxonomy.
//!
//! Every error that crosses the facade boundary is one of these variants;
//! subsystem-local error types convert into it via `From`.

use std::path::PathBuf;

/// Errors surfaced by the memory engine
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Schema, sanitization, path traversal, or namespace validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// An active decision already exists for the (target, namespace)
    #[error("{0}")]
    Conflict(String),

    /// A facade-level invariant could not be satisfied
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// One of the integrity invariants I1-I5 failed during a scan or commit
    #[error("[{fid}] {message}")]
    Integrity {
        /// Offending artifact id
        fid: String,
        /// What went wrong
        message: String,
    },

    /// Trust boundary or isolation denial
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown artifact or event
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lock acquisition exceeded its budget
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The audit backend could not be initialized or exhausted its retries
    #[error("Audit backend unavailable: {0}")]
    AuditUnavailable(String),

    /// A transactional group failed and was rolled back
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Metadata or episodic store error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact front-matter could not be serialized
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage path exists but is unusable
    #[error("Storage unavailable at {path}: {reason}")]
    StorageUnavailable {
        /// Offending path
        path: PathBuf,
        /// Why it cannot be used
        reason: String,
    },
}

impl MemoryError {
    /// Shorthand for an integrity violation tied to an artifact
    pub fn integrity(fid: impl Into<String>, message: impl Into<String>) -> Self {
        MemoryError::Integrity {
            fid: fid.into(),
            message: message.into(),
        }
    }

    /// True for conflict-class errors (used by callers that retry differently)
    pub fn is_conflict(&self) -> bool {
        matches!(self, MemoryError::Conflict(_))
    }
}

/// Crate result type
pub type Result<T> = std::result::Result<T, MemoryError>;
