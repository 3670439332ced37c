//! Append-only versioned audit of semantic artifacts.
//!
//! The default backend is a local git repository (libgit2): one commit per
//! artifact mutation, plus a transaction commit grouping staged changes.
//! Contended operations retry with exponential backoff; "nothing to
//! commit" is success. When the backend cannot be initialized and audit is
//! disabled by configuration, the null backend records nothing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{ErrorCode, IndexAddOption, Repository, Signature};

use crate::error::{MemoryError, Result};

/// Maximum retry attempts for contended repository operations
const MAX_RETRIES: u32 = 15;

/// Base backoff delay; attempt i sleeps `base * 1.4^i`
const BACKOFF_BASE: Duration = Duration::from_millis(300);

/// One commit in an artifact's history
#[derive(Debug, Clone)]
pub struct AuditCommit {
    /// Commit id (hex)
    pub id: String,
    /// Commit message
    pub message: String,
    /// Author name
    pub author: String,
    /// Commit time, seconds since the epoch
    pub timestamp: i64,
}

/// Versioned store of artifact changes
pub trait AuditBackend: Send + Sync {
    /// Prepare the backend (idempotent)
    fn initialize(&self) -> Result<()>;

    /// Whether the backend is in a usable state
    fn is_healthy(&self) -> bool;

    /// Record a new artifact with its own commit
    fn add_artifact(&self, relative_path: &str, message: &str) -> Result<()>;

    /// Record an artifact change with its own commit
    fn update_artifact(&self, relative_path: &str, message: &str) -> Result<()>;

    /// Stage an artifact for the enclosing transaction commit
    fn stage_artifact(&self, relative_path: &str) -> Result<()>;

    /// Remove an artifact from tracking
    fn purge_artifact(&self, relative_path: &str) -> Result<()>;

    /// Commit everything staged (empty commits allowed)
    fn commit_transaction(&self, message: &str) -> Result<()>;

    /// Discard staged and working-tree changes back to the last commit
    fn reset_to_head(&self) -> Result<()>;

    /// Current head id, if any history exists
    fn get_head_hash(&self) -> Option<String>;

    /// Commits that touched the given artifact, newest first
    fn get_history(&self, relative_path: &str) -> Result<Vec<AuditCommit>>;

    /// Whether a file is already tracked
    fn is_tracked(&self, relative_path: &str) -> bool;
}

// ============================================================================
// GIT BACKEND
// ============================================================================

/// Audit backend over a local git repository
pub struct GitAuditBackend {
    repo_path: PathBuf,
}

impl GitAuditBackend {
    /// Create a backend rooted at the given directory
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_path)
            .map_err(|e| MemoryError::AuditUnavailable(format!("cannot open repository: {e}")))
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        let name = std::env::var("GIT_AUTHOR_NAME").unwrap_or_else(|_| {
            repo.config()
                .and_then(|c| c.get_string("user.name"))
                .unwrap_or_else(|_| "ledgermind-core".to_string())
        });
        let email = std::env::var("GIT_AUTHOR_EMAIL").unwrap_or_else(|_| {
            repo.config()
                .and_then(|c| c.get_string("user.email"))
                .unwrap_or_else(|_| "agent@memory.local".to_string())
        });
        Signature::now(&name, &email)
            .map_err(|e| MemoryError::AuditUnavailable(format!("invalid commit identity: {e}")))
    }

    /// Run an operation with exponential backoff on lock contention
    fn with_retry<T>(&self, mut op: impl FnMut() -> std::result::Result<T, git2::Error>) -> Result<T> {
        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let contended = e.code() == ErrorCode::Locked
                        || e.message().contains("index.lock")
                        || e.message().contains("failed to lock")
                        || e.message().contains("File exists");
                    last_error = e.message().to_string();
                    if !contended {
                        return Err(MemoryError::AuditUnavailable(last_error));
                    }
                    let backoff = BACKOFF_BASE.mul_f64(1.4f64.powi(attempt as i32));
                    std::thread::sleep(backoff);
                }
            }
        }
        Err(MemoryError::AuditUnavailable(format!(
            "git failed after {MAX_RETRIES} retries: {last_error}"
        )))
    }

    /// Commit the current index; a no-op when the tree matches HEAD and
    /// empty commits are not allowed.
    fn commit_index(&self, repo: &Repository, message: &str, allow_empty: bool) -> Result<()> {
        self.with_retry(|| {
            let mut index = repo.index()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;

            let parent = match repo.head() {
                Ok(head) => Some(head.peel_to_commit()?),
                Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                    None
                }
                Err(e) => return Err(e),
            };

            // "Nothing to commit" is treated as success
            if !allow_empty {
                if let Some(ref p) = parent {
                    if p.tree_id() == tree_id {
                        return Ok(());
                    }
                }
            }

            let sig = match Self::signature(repo) {
                Ok(s) => s,
                Err(_) => Signature::now("ledgermind-core", "agent@memory.local")?,
            };
            let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
            index.write()?;
            Ok(())
        })
    }

    fn stage_path(&self, repo: &Repository, relative_path: &str) -> Result<()> {
        self.with_retry(|| {
            let mut index = repo.index()?;
            index.add_path(Path::new(relative_path))?;
            index.write()?;
            Ok(())
        })
    }
}

impl AuditBackend for GitAuditBackend {
    fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_path)?;
        if self.repo_path.join(".git").exists() {
            return Ok(());
        }
        tracing::info!(path = %self.repo_path.display(), "initializing audit repository");

        let repo = Repository::init(&self.repo_path)
            .map_err(|e| MemoryError::AuditUnavailable(format!("git init failed: {e}")))?;

        {
            let mut config = repo
                .config()
                .map_err(|e| MemoryError::AuditUnavailable(e.message().to_string()))?;
            let name =
                std::env::var("GIT_AUTHOR_NAME").unwrap_or_else(|_| "ledgermind-core".to_string());
            let email = std::env::var("GIT_AUTHOR_EMAIL")
                .unwrap_or_else(|_| "agent@memory.local".to_string());
            let _ = config.set_str("user.name", &name);
            let _ = config.set_str("user.email", &email);
        }

        let gitignore = self.repo_path.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(
                &gitignore,
                "\n.lock\n.lock.pid\n.tx_backup/\nsemantic_meta.db*\n",
            )?;
        }
        self.stage_path(&repo, ".gitignore")?;
        self.commit_index(&repo, "Initial commit", true)?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        Repository::open(&self.repo_path).is_ok()
    }

    fn add_artifact(&self, relative_path: &str, message: &str) -> Result<()> {
        let repo = self.open()?;
        self.stage_path(&repo, relative_path)?;
        self.commit_index(&repo, message, false)
    }

    fn update_artifact(&self, relative_path: &str, message: &str) -> Result<()> {
        self.add_artifact(relative_path, message)
    }

    fn stage_artifact(&self, relative_path: &str) -> Result<()> {
        let repo = self.open()?;
        self.stage_path(&repo, relative_path)
    }

    fn purge_artifact(&self, relative_path: &str) -> Result<()> {
        let repo = self.open()?;
        let result = self.with_retry(|| {
            let mut index = repo.index()?;
            index.remove_path(Path::new(relative_path))?;
            index.write()?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(path = relative_path, "failed to purge from audit: {e}");
            return Ok(());
        }
        self.commit_index(&repo, &format!("Purge: {relative_path}"), false)
    }

    fn commit_transaction(&self, message: &str) -> Result<()> {
        let repo = self.open()?;
        self.commit_index(&repo, message, true)
    }

    fn reset_to_head(&self) -> Result<()> {
        let repo = self.open()?;
        self.with_retry(|| {
            let head = repo.head()?.peel(git2::ObjectType::Commit)?;
            repo.reset(&head, git2::ResetType::Hard, None)?;
            Ok(())
        })
    }

    fn get_head_hash(&self) -> Option<String> {
        let repo = Repository::open(&self.repo_path).ok()?;
        let head = repo.head().ok()?;
        head.target().map(|oid| oid.to_string())
    }

    fn get_history(&self, relative_path: &str) -> Result<Vec<AuditCommit>> {
        let repo = self.open()?;
        let mut commits = Vec::new();

        let mut revwalk = match repo.revwalk() {
            Ok(w) => w,
            Err(_) => return Ok(commits),
        };
        if revwalk.push_head().is_err() {
            return Ok(commits);
        }

        let target = Path::new(relative_path);
        for oid in revwalk.flatten() {
            let Ok(commit) = repo.find_commit(oid) else {
                continue;
            };
            let tree = commit.tree().ok();
            let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

            let touched = match (&tree, &parent_tree) {
                (Some(tree), parent) => {
                    let mut opts = git2::DiffOptions::new();
                    opts.pathspec(relative_path);
                    repo.diff_tree_to_tree(parent.as_ref(), Some(tree), Some(&mut opts))
                        .map(|d| d.deltas().len() > 0)
                        .unwrap_or(false)
                }
                _ => false,
            };
            // Root commits with the file present count as touching it
            let in_root = parent_tree.is_none()
                && tree
                    .as_ref()
                    .is_some_and(|t| t.get_path(target).is_ok());

            if touched || in_root {
                commits.push(AuditCommit {
                    id: oid.to_string(),
                    message: commit.message().unwrap_or("").to_string(),
                    author: commit.author().name().unwrap_or("").to_string(),
                    timestamp: commit.time().seconds(),
                });
            }
        }
        Ok(commits)
    }

    fn is_tracked(&self, relative_path: &str) -> bool {
        let Ok(repo) = Repository::open(&self.repo_path) else {
            return false;
        };
        repo.index()
            .ok()
            .and_then(|idx| idx.get_path(Path::new(relative_path), 0))
            .is_some()
    }
}

/// Convenience: stage every artifact matching the given pathspecs
pub fn stage_all(repo_path: &Path, patterns: &[&str]) -> Result<()> {
    let repo = Repository::open(repo_path)
        .map_err(|e| MemoryError::AuditUnavailable(e.message().to_string()))?;
    let mut index = repo
        .index()
        .map_err(|e| MemoryError::AuditUnavailable(e.message().to_string()))?;
    index
        .add_all(patterns.iter(), IndexAddOption::DEFAULT, None)
        .map_err(|e| MemoryError::AuditUnavailable(e.message().to_string()))?;
    index
        .write()
        .map_err(|e| MemoryError::AuditUnavailable(e.message().to_string()))?;
    Ok(())
}

// ============================================================================
// NULL BACKEND
// ============================================================================

/// No-op backend used when audit is disabled or unavailable
pub struct NullAuditBackend;

impl AuditBackend for NullAuditBackend {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }
    fn is_healthy(&self) -> bool {
        true
    }
    fn add_artifact(&self, _relative_path: &str, _message: &str) -> Result<()> {
        Ok(())
    }
    fn update_artifact(&self, _relative_path: &str, _message: &str) -> Result<()> {
        Ok(())
    }
    fn stage_artifact(&self, _relative_path: &str) -> Result<()> {
        Ok(())
    }
    fn purge_artifact(&self, _relative_path: &str) -> Result<()> {
        Ok(())
    }
    fn commit_transaction(&self, _message: &str) -> Result<()> {
        Ok(())
    }
    fn reset_to_head(&self) -> Result<()> {
        Ok(())
    }
    fn get_head_hash(&self) -> Option<String> {
        None
    }
    fn get_history(&self, _relative_path: &str) -> Result<Vec<AuditCommit>> {
        Ok(vec![])
    }
    fn is_tracked(&self, _relative_path: &str) -> bool {
        true
    }
}
