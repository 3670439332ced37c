//! Filesystem write-ahead backup for transactional groups.
//!
//! `begin` is driven by the semantic store: it opens a metadata savepoint
//! and prepares a clean `.tx_backup` directory. The first time a path is
//! staged, its current content (if any) is copied into the backup
//! directory. On rollback, backed-up files are restored and files created
//! during the transaction are deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::storage::meta::SemanticMetaStore;

/// Name of the backup directory inside the repository
pub const TX_BACKUP_DIR: &str = ".tx_backup";

/// One in-flight transactional group over a repository
pub struct TransactionManager {
    repo_path: PathBuf,
    backup_dir: PathBuf,
    meta: Arc<SemanticMetaStore>,
    staged: Vec<String>,
}

impl TransactionManager {
    /// Start a transaction: metadata savepoint plus a clean backup dir.
    ///
    /// The caller must already hold the repository's exclusive lock.
    pub fn begin(repo_path: impl AsRef<Path>, meta: Arc<SemanticMetaStore>) -> Result<Self> {
        let repo_path = repo_path.as_ref().to_path_buf();
        let backup_dir = repo_path.join(TX_BACKUP_DIR);

        meta.savepoint_begin()?;

        if backup_dir.exists() {
            std::fs::remove_dir_all(&backup_dir)?;
        }
        std::fs::create_dir_all(&backup_dir)?;

        Ok(Self {
            repo_path,
            backup_dir,
            meta,
            staged: Vec::new(),
        })
    }

    /// Paths staged so far
    pub fn staged_files(&self) -> &[String] {
        &self.staged
    }

    /// Mark a file as part of the transaction, backing up existing content
    /// the first time the path is touched.
    pub fn stage_file(&mut self, relative_path: &str) -> Result<()> {
        if self.staged.iter().any(|p| p == relative_path) {
            return Ok(());
        }
        let full_path = self.repo_path.join(relative_path);
        if full_path.exists() {
            let backup_path = self.backup_dir.join(relative_path);
            if let Some(parent) = backup_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&full_path, &backup_path)?;
        }
        self.staged.push(relative_path.to_string());
        Ok(())
    }

    /// Verify staged files and release the metadata savepoint
    pub fn commit(self) -> Result<()> {
        for rel_path in &self.staged {
            let full_path = self.repo_path.join(rel_path);
            if !full_path.exists() {
                // Roll everything back before surfacing the failure
                let err = MemoryError::Transaction(format!(
                    "Atomic commit failed: file {rel_path} missing before commit"
                ));
                self.rollback()?;
                return Err(err);
            }
            if std::fs::metadata(&full_path)?.len() == 0 {
                tracing::warn!(path = rel_path, "file is empty during commit verification");
            }
        }
        self.meta.savepoint_release()?;
        let _ = std::fs::remove_dir_all(&self.backup_dir);
        Ok(())
    }

    /// Restore backed-up files, delete files created during the
    /// transaction, and roll the metadata savepoint back.
    pub fn rollback(self) -> Result<()> {
        for rel_path in &self.staged {
            let full_path = self.repo_path.join(rel_path);
            let backup_path = self.backup_dir.join(rel_path);
            if backup_path.exists() {
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&backup_path, &full_path)?;
            } else if full_path.exists() {
                std::fs::remove_file(&full_path)?;
            }
        }
        let result = self.meta.savepoint_rollback();
        let _ = std::fs::remove_dir_all(&self.backup_dir);
        result
    }
}
