//! Semantic store - versioned artifacts with a transactional metadata index.
//!
//! The filesystem blob is the canonical artifact body, the metadata index
//! owns the authoritative state for querying, and the audit backend owns
//! the versioned history. A single logical write commits atomically across
//! all three: outside a transaction each mutation carries its own
//! cleanup, inside one the transaction manager backs files up and the
//! metadata savepoint scopes the index.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::schema::{
    sanitize::{validate_fid, validate_namespace},
    EventKind, EventSource, MemoryEvent, TrustBoundary,
};
use crate::storage::audit::{AuditBackend, AuditCommit, GitAuditBackend, NullAuditBackend};
use crate::storage::frontmatter::{self, ArtifactDocument};
use crate::storage::integrity::IntegrityChecker;
use crate::storage::lock::{FileSystemLock, LockMode};
use crate::storage::meta::{MetaRow, SemanticMetaStore};
use crate::storage::transactions::TransactionManager;

thread_local! {
    /// Repositories this thread currently holds a transaction on
    static IN_TX: RefCell<HashSet<PathBuf>> = RefCell::new(HashSet::new());
}

/// Store for long-term semantic records
pub struct SemanticStore {
    repo_path: PathBuf,
    /// Relational index over the artifacts
    pub meta: Arc<SemanticMetaStore>,
    audit: Box<dyn AuditBackend>,
    lock: FileSystemLock,
    integrity: IntegrityChecker,
    trust_boundary: TrustBoundary,
    tx: Mutex<Option<TransactionManager>>,
}

impl SemanticStore {
    /// Open the store, initializing the audit backend and reconciling the
    /// metadata index with the artifacts on disk.
    pub fn open(
        repo_path: impl AsRef<Path>,
        trust_boundary: TrustBoundary,
        enable_audit: bool,
    ) -> Result<Self> {
        let repo_path = repo_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&repo_path)?;

        let meta = Arc::new(SemanticMetaStore::open(repo_path.join("semantic_meta.db"))?);

        let audit: Box<dyn AuditBackend> = if enable_audit {
            let backend = GitAuditBackend::new(&repo_path);
            backend.initialize()?;
            Box::new(backend)
        } else {
            Box::new(NullAuditBackend)
        };

        let store = Self {
            lock: FileSystemLock::new(repo_path.join(".lock")),
            repo_path,
            meta,
            audit,
            integrity: IntegrityChecker::new(),
            trust_boundary,
            tx: Mutex::new(None),
        };

        store.reconcile_untracked()?;
        store.integrity.validate(&store.repo_path, false)?;
        store.sync_meta_index(false)?;
        Ok(store)
    }

    /// Repository root
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The repository's advisory lock
    pub fn lock(&self) -> &FileSystemLock {
        &self.lock
    }

    /// The integrity checker bound to this repository
    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    /// Whether the current thread is inside a transaction on this store
    pub fn in_transaction(&self) -> bool {
        IN_TX.with(|t| t.borrow().contains(&self.repo_path))
    }

    fn set_in_transaction(&self, value: bool) {
        IN_TX.with(|t| {
            if value {
                t.borrow_mut().insert(self.repo_path.clone());
            } else {
                t.borrow_mut().remove(&self.repo_path);
            }
        });
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Group multiple operations into one ACID unit.
    ///
    /// Re-entrant: a nested call on the same thread joins the enclosing
    /// transaction. On success the integrity scan runs, the audit backend
    /// commits everything staged, and the metadata savepoint is released;
    /// on any error files are restored from backup, the savepoint rolls
    /// back, the audit head is reset, and the index is re-synced from disk.
    pub fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.in_transaction() {
            return f();
        }

        let _guard = self.lock.acquire(LockMode::Exclusive, None)?;
        let tm = TransactionManager::begin(&self.repo_path, self.meta.clone())?;
        *self.tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tm);
        self.set_in_transaction(true);

        let result = f();
        self.set_in_transaction(false);
        let tm = self
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| MemoryError::Transaction("transaction state lost".into()))?;

        let outcome = match result {
            Ok(value) => self
                .integrity
                .validate(&self.repo_path, false)
                .and_then(|()| self.audit.commit_transaction("Atomic Transaction Commit"))
                .map(|()| value),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => {
                tm.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::error!("transaction failed: {e}; rolling back");
                if let Err(rb) = tm.rollback() {
                    tracing::error!("filesystem rollback failed: {rb}");
                }
                if let Err(rb) = self.audit.reset_to_head() {
                    tracing::warn!("audit reset failed: {rb}");
                }
                self.integrity.invalidate(&self.repo_path);
                if let Err(sync) = self.sync_meta_index(false) {
                    tracing::error!("meta resync after rollback failed: {sync}");
                }
                Err(e)
            }
        }
    }

    fn stage_in_tx(&self, relative_path: &str) -> Result<()> {
        if let Some(tm) = self
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_mut()
        {
            tm.stage_file(relative_path)?;
        }
        Ok(())
    }

    // ========================================================================
    // TRUST
    // ========================================================================

    fn enforce_trust(&self, event: Option<&MemoryEvent>) -> Result<()> {
        if self.trust_boundary == TrustBoundary::HumanOnly {
            let agent_decision = event.is_none_or(|e| {
                e.source == EventSource::Agent && e.kind == EventKind::Decision
            });
            if agent_decision {
                return Err(MemoryError::PermissionDenied(
                    "Trust Boundary Violation".into(),
                ));
            }
        }
        Ok(())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Persist a semantic event as a new artifact, returning its id.
    pub fn save(&self, event: &MemoryEvent, namespace: Option<&str>) -> Result<String> {
        self.enforce_trust(Some(event))?;
        if let Some(ns) = namespace {
            validate_namespace(ns)?;
        }

        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Exclusive, None)?)
        };

        let effective_dir = namespace.filter(|ns| *ns != "default");

        let suffix = Uuid::new_v4().simple().to_string();
        let filename = format!(
            "{}_{}_{}.md",
            event.kind.as_str(),
            event.timestamp.format("%Y%m%d_%H%M%S_%6f"),
            &suffix[..8]
        );
        let relative_path = match effective_dir {
            Some(ns) => format!("{ns}/{filename}"),
            None => filename,
        };
        let full_path = self.repo_path.join(&relative_path);

        if in_tx {
            self.stage_in_tx(&relative_path)?;
        }
        if let Some(ns) = effective_dir {
            std::fs::create_dir_all(self.repo_path.join(ns))?;
        }

        let context_value = event.context.to_value();
        let doc = ArtifactDocument {
            kind: event.kind.as_str().to_string(),
            source: event.source.as_str().to_string(),
            content: event.content.clone(),
            timestamp: Some(event.timestamp.to_rfc3339()),
            schema_version: event.schema_version,
            context: context_value.clone(),
        };
        let body = format!(
            "# {}\n\nRecorded from source: {}\n",
            event.content, event.source
        );
        let blob = frontmatter::stringify(&doc, &body)?;
        std::fs::write(&full_path, blob)?;

        let final_namespace = namespace
            .map(String::from)
            .or_else(|| context_value.get("namespace").and_then(|v| v.as_str().map(String::from)))
            .unwrap_or_else(|| "default".to_string());

        let upsert = self.upsert_metadata(
            &relative_path,
            &doc,
            &final_namespace,
            context_value
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("active"),
        );
        if let Err(e) = upsert {
            if !in_tx && full_path.exists() {
                let _ = std::fs::remove_file(&full_path);
            }
            return Err(e);
        }

        if in_tx {
            self.audit.stage_artifact(&relative_path)?;
        } else {
            let committed = self
                .integrity
                .validate(&self.repo_path, false)
                .and_then(|()| {
                    self.audit.add_artifact(
                        &relative_path,
                        &format!(
                            "Add {}: {}",
                            event.kind,
                            event.content.chars().take(50).collect::<String>()
                        ),
                    )
                });
            if let Err(e) = committed {
                let _ = std::fs::remove_file(&full_path);
                let _ = self.meta.delete(&relative_path);
                self.integrity.invalidate(&self.repo_path);
                return Err(e);
            }
        }

        Ok(relative_path)
    }

    /// Merge updates into an artifact's context and re-commit it.
    pub fn update_decision(
        &self,
        fid: &str,
        updates: &serde_json::Map<String, Value>,
        commit_msg: &str,
    ) -> Result<()> {
        validate_fid(fid)?;
        self.enforce_trust(None)?;

        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Exclusive, None)?)
        };

        if in_tx {
            self.stage_in_tx(fid)?;
        }

        let full_path = self.repo_path.join(fid);
        if !full_path.exists() {
            return Err(MemoryError::NotFound(format!("Unknown artifact: {fid}")));
        }
        let original = std::fs::read_to_string(&full_path)?;
        let (parsed, body) = frontmatter::parse(&original);
        let mut doc = parsed
            .ok_or_else(|| MemoryError::integrity(fid, "Corrupted or empty frontmatter"))?;

        if !doc.context.is_object() {
            doc.context = Value::Object(serde_json::Map::new());
        }
        if let Some(ctx) = doc.context.as_object_mut() {
            for (key, value) in updates {
                ctx.insert(key.clone(), value.clone());
            }
        }

        let blob = frontmatter::stringify(&doc, &body)?;
        std::fs::write(&full_path, blob)?;

        let namespace = doc
            .context_str("namespace")
            .map(String::from)
            .unwrap_or_else(|| "default".to_string());
        let status = doc
            .context_str("status")
            .map(String::from)
            .unwrap_or_else(|| "active".to_string());

        if let Err(e) = self.upsert_metadata(fid, &doc, &namespace, &status) {
            if !in_tx {
                let _ = std::fs::write(&full_path, &original);
            }
            return Err(e);
        }

        if in_tx {
            self.audit.stage_artifact(fid)?;
        } else {
            let committed = self
                .integrity
                .validate(&self.repo_path, false)
                .and_then(|()| self.audit.update_artifact(fid, commit_msg));
            if let Err(e) = committed {
                let _ = std::fs::write(&full_path, &original);
                self.integrity.invalidate(&self.repo_path);
                let _ = self.sync_meta_index(false);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Hard delete: filesystem, audit tracking, and metadata row.
    pub fn purge_memory(&self, fid: &str) -> Result<()> {
        validate_fid(fid)?;
        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Exclusive, None)?)
        };

        let full_path = self.repo_path.join(fid);
        if full_path.exists() {
            std::fs::remove_file(&full_path)?;
        }
        self.audit.purge_artifact(fid)?;
        self.meta.delete(fid)?;
        self.integrity.invalidate(&self.repo_path);
        Ok(())
    }

    fn upsert_metadata(
        &self,
        fid: &str,
        doc: &ArtifactDocument,
        namespace: &str,
        status: &str,
    ) -> Result<()> {
        let ctx = &doc.context;
        let rationale = ctx.get("rationale").and_then(|v| v.as_str()).unwrap_or("");
        let cached_content = if rationale.is_empty() {
            doc.content.clone()
        } else {
            format!("{}\n{}", doc.content, rationale)
        };
        let keywords = ctx
            .get("keywords")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        let row = MetaRow {
            fid: fid.to_string(),
            target: ctx
                .get("target")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            title: ctx
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            status: status.to_string(),
            kind: doc.kind.clone(),
            timestamp: doc
                .timestamp
                .clone()
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            superseded_by: ctx
                .get("superseded_by")
                .and_then(|v| v.as_str())
                .map(String::from),
            content: cached_content,
            keywords,
            confidence: ctx.get("confidence").and_then(|v| v.as_f64()).unwrap_or(1.0),
            namespace: namespace.to_string(),
            hit_count: 0,
            last_hit_at: None,
            context_json: ctx.to_string(),
            phase: ctx
                .get("phase")
                .and_then(|v| v.as_str())
                .unwrap_or("pattern")
                .to_string(),
            vitality: ctx
                .get("vitality")
                .and_then(|v| v.as_str())
                .unwrap_or("active")
                .to_string(),
            reinforcement_density: ctx
                .get("reinforcement_density")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            stability_score: ctx
                .get("stability_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            coverage: ctx.get("coverage").and_then(|v| v.as_f64()).unwrap_or(0.0),
        };
        self.meta.upsert(&row)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// All artifact ids known to the index
    pub fn list_decisions(&self) -> Result<Vec<String>> {
        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Shared, None)?)
        };
        Ok(self.meta.list_all()?.into_iter().map(|m| m.fid).collect())
    }

    /// Active decision ids for (target, namespace)
    pub fn list_active_conflicts(&self, target: &str, namespace: &str) -> Result<Vec<String>> {
        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Shared, None)?)
        };
        self.meta.list_active_conflicts(target, namespace)
    }

    /// Load an artifact's front-matter and body
    pub fn load_artifact(&self, fid: &str) -> Result<(ArtifactDocument, String)> {
        validate_fid(fid)?;
        let full_path = self.repo_path.join(fid);
        if !full_path.exists() {
            return Err(MemoryError::NotFound(format!("Unknown artifact: {fid}")));
        }
        let content = std::fs::read_to_string(&full_path)?;
        let (parsed, body) = frontmatter::parse(&content);
        let doc = parsed
            .ok_or_else(|| MemoryError::integrity(fid, "Corrupted or empty frontmatter"))?;
        Ok((doc, body))
    }

    /// Current audit head id
    pub fn get_head_hash(&self) -> Option<String> {
        self.audit.get_head_hash()
    }

    /// Commit history for one artifact
    pub fn get_history(&self, fid: &str) -> Result<Vec<AuditCommit>> {
        validate_fid(fid)?;
        self.audit.get_history(fid)
    }

    /// Whether the audit backend is usable
    pub fn audit_healthy(&self) -> bool {
        self.audit.is_healthy()
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Commit artifacts present on disk but unknown to the audit backend.
    pub fn reconcile_untracked(&self) -> Result<()> {
        let _guard = self.lock.acquire(LockMode::Exclusive, None)?;
        for rel in IntegrityChecker::walk_artifacts(&self.repo_path) {
            if !self.audit.is_tracked(&rel) {
                tracing::info!(fid = %rel, "recovering untracked artifact");
                if let Err(e) = self
                    .audit
                    .add_artifact(&rel, &format!("Recovery: Auto-adding untracked file {rel}"))
                {
                    tracing::error!(fid = %rel, "failed to recover: {e}");
                }
            }
        }
        Ok(())
    }

    /// Bring the metadata index in line with the artifacts on disk.
    ///
    /// Orphan rows are deleted; new or modified files are re-parsed (a
    /// timestamp-vs-mtime heuristic skips unchanged ones). `force` also
    /// re-runs the integrity scan.
    pub fn sync_meta_index(&self, force: bool) -> Result<()> {
        let in_tx = self.in_transaction();
        let _guard = if in_tx {
            None
        } else {
            Some(self.lock.acquire(LockMode::Exclusive, None)?)
        };

        if force {
            self.integrity.validate(&self.repo_path, true)?;
        }

        let disk_files: HashSet<String> =
            IntegrityChecker::walk_artifacts(&self.repo_path).into_iter().collect();
        let meta_rows = self.meta.list_all().unwrap_or_default();
        let meta_files: HashSet<String> = meta_rows.iter().map(|m| m.fid.clone()).collect();

        if disk_files == meta_files && !force {
            return Ok(());
        }
        if disk_files != meta_files {
            tracing::info!(
                on_disk = disk_files.len(),
                in_meta = meta_files.len(),
                "syncing semantic meta index"
            );
        }

        for orphan in meta_files.difference(&disk_files) {
            tracing::debug!(fid = %orphan, "removing orphan from meta");
            self.meta.delete(orphan)?;
        }

        for rel in &disk_files {
            let full_path = self.repo_path.join(rel);
            let mtime = std::fs::metadata(&full_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            if !force {
                if let Ok(Some(existing)) = self.meta.get_by_fid(rel) {
                    let close = frontmatter::parse_timestamp(&existing.timestamp)
                        .map(|ts| (ts.timestamp() as f64 - mtime).abs() < 1.0)
                        .unwrap_or(false);
                    if close {
                        continue;
                    }
                }
            }

            let Ok(raw) = std::fs::read_to_string(&full_path) else {
                continue;
            };
            let (parsed, _body) = frontmatter::parse(&raw);
            let Some(mut doc) = parsed else {
                tracing::error!(fid = %rel, "failed to index: unparseable front-matter");
                continue;
            };
            if doc.timestamp.is_none() {
                // Use the file mtime when no internal timestamp exists
                let fallback = chrono::DateTime::from_timestamp(mtime as i64, 0)
                    .unwrap_or_else(Utc::now);
                doc.timestamp = Some(fallback.to_rfc3339());
            }

            // Directory name overrides any absent context namespace
            let dir_ns = Path::new(rel)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .filter(|p| !p.is_empty());
            let namespace = doc
                .context_str("namespace")
                .map(String::from)
                .or(dir_ns)
                .unwrap_or_else(|| "default".to_string());
            let status = doc
                .context_str("status")
                .map(String::from)
                .unwrap_or_else(|| "unknown".to_string());

            if let Err(e) = self.upsert_metadata(rel, &doc, &namespace, &status) {
                tracing::error!(fid = %rel, "failed to index: {e}");
            }
        }
        Ok(())
    }
}
