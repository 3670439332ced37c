//! Git history ingester - commits become episodic events.
//!
//! Walks the project repository from the last indexed commit (watermark in
//! the metadata config store) and appends one `commit_change` event per
//! new commit, with changed files and an inferred target in the context.
//! Duplicate suppression is owned by the episodic store.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use git2::Repository;
use regex::Regex;
use serde_json::json;

use crate::error::{MemoryError, Result};
use crate::schema::{EventContext, EventKind, EventSource, MemoryEvent};

/// Config key holding the last indexed commit hash
pub const LAST_INDEXED_KEY: &str = "last_indexed_commit_hash";

fn hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-f0-9]{4,40}$").expect("static regex"))
}

/// One commit pulled from the project history
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// Full commit hash
    pub hash: String,
    /// Author name
    pub author: String,
    /// Commit time
    pub date: DateTime<Utc>,
    /// First line of the message
    pub subject: String,
    /// Rest of the message
    pub body: String,
    /// Paths touched by the commit
    pub changed_files: Vec<String>,
}

/// Indexes project commits into episodic memory
pub struct GitIndexer {
    repo_path: PathBuf,
}

impl GitIndexer {
    /// Create an indexer for the given repository path.
    ///
    /// The path must resolve inside the current working directory; walking
    /// out of the allowed scope is a validation error.
    pub fn new(repo_path: impl AsRef<Path>) -> Result<Self> {
        let abs = std::fs::canonicalize(repo_path.as_ref())
            .map_err(|e| MemoryError::Validation(format!("Invalid repository path: {e}")))?;
        let cwd = std::env::current_dir()?
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from("."));
        if !abs.starts_with(&cwd) {
            return Err(MemoryError::Validation(format!(
                "Security violation: access to {} is outside the allowed scope (CWD: {})",
                abs.display(),
                cwd.display()
            )));
        }
        Ok(Self { repo_path: abs })
    }

    /// Recent commits, oldest first, stopping at `since_hash` when given.
    pub fn get_recent_commits(
        &self,
        limit: usize,
        since_hash: Option<&str>,
    ) -> Result<Vec<CommitInfo>> {
        let Ok(repo) = Repository::open(&self.repo_path) else {
            // Not a repository, or git unavailable
            return Ok(vec![]);
        };

        // A malformed watermark is ignored rather than injected
        let since = since_hash.filter(|h| {
            let valid = hash_re().is_match(h);
            if !valid {
                tracing::warn!(hash = h, "invalid since_hash; ignoring");
            }
            valid
        });

        let mut revwalk = match repo.revwalk() {
            Ok(w) => w,
            Err(_) => return Ok(vec![]),
        };
        if revwalk.push_head().is_err() {
            return Ok(vec![]);
        }

        let mut commits = Vec::new();
        for oid in revwalk.flatten().take(limit) {
            if let Some(since) = since {
                if oid.to_string().starts_with(since) {
                    break;
                }
            }
            let Ok(commit) = repo.find_commit(oid) else {
                continue;
            };

            let changed_files = Self::changed_files(&repo, &commit);
            let message = commit.message().unwrap_or("");
            let mut lines = message.splitn(2, '\n');
            let subject = lines.next().unwrap_or("").trim().to_string();
            let body = lines.next().unwrap_or("").trim().to_string();

            commits.push(CommitInfo {
                hash: oid.to_string(),
                author: commit.author().name().unwrap_or("").to_string(),
                date: DateTime::from_timestamp(commit.time().seconds(), 0)
                    .unwrap_or_else(Utc::now),
                subject,
                body,
                changed_files,
            });
        }
        commits.reverse();
        Ok(commits)
    }

    fn changed_files(repo: &Repository, commit: &git2::Commit<'_>) -> Vec<String> {
        let Ok(tree) = commit.tree() else {
            return vec![];
        };
        let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());
        let Ok(diff) = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None) else {
            return vec![];
        };
        diff.deltas()
            .filter_map(|d| {
                d.new_file()
                    .path()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect()
    }

    /// Infer a target from the first changed path: for
    /// `src/module/file.rs` the target is `module`, for `module/file.rs`
    /// it is `module`.
    pub fn infer_target(changed_files: &[String]) -> Option<String> {
        let first = changed_files.first()?;
        let parts: Vec<&str> = first.split('/').collect();
        if parts.len() < 2 {
            return None;
        }
        if matches!(parts[0], "src" | "lib" | "app") {
            parts.get(1).map(|s| s.to_string())
        } else {
            Some(parts[0].to_string())
        }
    }

    /// Build the episodic event for one commit
    pub fn commit_event(commit: &CommitInfo) -> Result<MemoryEvent> {
        let target = Self::infer_target(&commit.changed_files);
        let mut event = MemoryEvent::new(
            EventSource::System,
            EventKind::CommitChange,
            &format!("Commit by {}: {}", commit.author, commit.subject),
            Some(EventContext::Map(json!({
                "hash": commit.hash,
                "author": commit.author,
                "full_message": commit.body,
                "changed_files": commit.changed_files,
                "target": target,
                "type": "git_history",
            }))),
        )?;
        event.timestamp = commit.date;
        Ok(event)
    }
}
