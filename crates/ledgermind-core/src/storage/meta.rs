//! Metadata index over semantic artifacts.
//!
//! One row per artifact. The store owns the authoritative state for
//! querying; the unique partial index on (target, namespace) is the
//! DB-level guarantee behind invariant I4. Writes enlist in the active
//! transaction via savepoints on the writer connection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{MemoryError, Result};

/// Truth-resolution walks give up past this many hops
pub const MAX_RESOLVE_DEPTH: usize = 20;

/// Cached artifact body is capped at this many bytes for keyword search
pub const CONTENT_CACHE_LIMIT: usize = 8_000;

// ============================================================================
// MIGRATIONS
// ============================================================================

/// A schema migration
struct Migration {
    version: u32,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        up: MIGRATION_V2_UP,
    },
];

/// V1: identity, status, and the unique-active partial index
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS semantic_meta (
    fid TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    title TEXT DEFAULT '',
    status TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    superseded_by TEXT,
    content TEXT DEFAULT '',
    keywords TEXT DEFAULT '',
    confidence REAL DEFAULT 1.0,
    namespace TEXT DEFAULT 'default',
    hit_count INTEGER DEFAULT 0,
    last_hit_at TEXT,
    context_json TEXT DEFAULT '{}'
);

-- I4 prevention: only one active decision per (target, namespace)
CREATE UNIQUE INDEX IF NOT EXISTS idx_active_target_ns
ON semantic_meta(target, namespace) WHERE status = 'active' AND kind = 'decision';

CREATE INDEX IF NOT EXISTS idx_meta_status ON semantic_meta(status);
CREATE INDEX IF NOT EXISTS idx_meta_target ON semantic_meta(target);
CREATE INDEX IF NOT EXISTS idx_meta_namespace ON semantic_meta(namespace);

CREATE TABLE IF NOT EXISTS sys_config (
    key TEXT PRIMARY KEY,
    value TEXT
);
"#;

/// V2: lifecycle signal columns
const MIGRATION_V2_UP: &str = r#"
ALTER TABLE semantic_meta ADD COLUMN phase TEXT DEFAULT 'pattern';
ALTER TABLE semantic_meta ADD COLUMN vitality TEXT DEFAULT 'active';
ALTER TABLE semantic_meta ADD COLUMN reinforcement_density REAL DEFAULT 0.0;
ALTER TABLE semantic_meta ADD COLUMN stability_score REAL DEFAULT 0.0;
ALTER TABLE semantic_meta ADD COLUMN coverage REAL DEFAULT 0.0;
"#;

// ============================================================================
// ROW TYPE
// ============================================================================

/// One metadata row
#[derive(Debug, Clone)]
pub struct MetaRow {
    /// Artifact id (relative path within the semantic root)
    pub fid: String,
    /// Normalized subject key
    pub target: String,
    /// Short human title
    pub title: String,
    /// Artifact status
    pub status: String,
    /// Producing event kind
    pub kind: String,
    /// Creation timestamp, RFC 3339
    pub timestamp: String,
    /// Successor id, when superseded
    pub superseded_by: Option<String>,
    /// Cached body for keyword search (capped)
    pub content: String,
    /// Comma-joined keywords
    pub keywords: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Isolation scope
    pub namespace: String,
    /// Retrieval count
    pub hit_count: i64,
    /// Last retrieval timestamp, RFC 3339
    pub last_hit_at: Option<String>,
    /// Full context map as JSON
    pub context_json: String,
    /// Lifecycle phase name
    pub phase: String,
    /// Lifecycle vitality name
    pub vitality: String,
    /// frequency / lifetime
    pub reinforcement_density: f64,
    /// Interval regularity score
    pub stability_score: f64,
    /// lifetime / observation window
    pub coverage: f64,
}

impl MetaRow {
    /// Parse the cached context map
    pub fn context(&self) -> Value {
        serde_json::from_str(&self.context_json).unwrap_or(Value::Null)
    }
}

const ROW_COLUMNS: &str = "fid, target, title, status, kind, timestamp, superseded_by, content, \
     keywords, confidence, namespace, hit_count, last_hit_at, context_json, phase, vitality, \
     reinforcement_density, stability_score, coverage";

/// Truncate at a UTF-8 boundary at or below `limit` bytes
fn truncate_at_boundary(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetaRow> {
    Ok(MetaRow {
        fid: row.get(0)?,
        target: row.get(1)?,
        title: row.get(2)?,
        status: row.get(3)?,
        kind: row.get(4)?,
        timestamp: row.get(5)?,
        superseded_by: row.get(6)?,
        content: row.get(7)?,
        keywords: row.get(8)?,
        confidence: row.get(9)?,
        namespace: row.get(10)?,
        hit_count: row.get(11)?,
        last_hit_at: row.get(12)?,
        context_json: row.get(13)?,
        phase: row.get(14)?,
        vitality: row.get(15)?,
        reinforcement_density: row.get(16)?,
        stability_score: row.get(17)?,
        coverage: row.get(18)?,
    })
}

// ============================================================================
// STORE
// ============================================================================

/// Relational metadata index backed by SQLite.
///
/// Separate reader/writer connections keep reads non-blocking; while a
/// savepoint is active, reads are routed through the writer connection so
/// transactional code observes its own uncommitted writes.
pub struct SemanticMetaStore {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    tx_active: AtomicBool,
}

impl SemanticMetaStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    /// Open or create the store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(&db_path)?;
        Self::configure_connection(&writer)?;
        Self::migrate(&writer)?;
        let reader = Connection::open(&db_path)?;
        Self::configure_connection(&reader)?;
        Ok(Self {
            db_path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            tx_active: AtomicBool::new(false),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let has_config = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'sys_config'",
                [],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let current: u32 = if has_config {
            conn.query_row(
                "SELECT value FROM sys_config WHERE key = 'schema_version'",
                [],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
        } else {
            0
        };

        for migration in MIGRATIONS {
            if migration.version > current {
                conn.execute_batch(migration.up)?;
                conn.execute(
                    "INSERT OR REPLACE INTO sys_config (key, value) VALUES ('schema_version', ?1)",
                    params![migration.version.to_string()],
                )?;
            }
        }
        Ok(())
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn write_conn(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        if self.tx_active.load(Ordering::Acquire) {
            self.write_conn()
        } else {
            self.reader.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    // ========================================================================
    // SAVEPOINTS (transaction enlistment)
    // ========================================================================

    /// Open the transaction savepoint on the writer connection
    pub fn savepoint_begin(&self) -> Result<()> {
        self.write_conn().execute_batch("SAVEPOINT ledgermind_tx")?;
        self.tx_active.store(true, Ordering::Release);
        Ok(())
    }

    /// Release (commit) the transaction savepoint
    pub fn savepoint_release(&self) -> Result<()> {
        let res = self.write_conn().execute_batch("RELEASE ledgermind_tx");
        self.tx_active.store(false, Ordering::Release);
        res.map_err(MemoryError::from)
    }

    /// Roll the savepoint back and release it
    pub fn savepoint_rollback(&self) -> Result<()> {
        let res = self
            .write_conn()
            .execute_batch("ROLLBACK TO ledgermind_tx; RELEASE ledgermind_tx");
        self.tx_active.store(false, Ordering::Release);
        res.map_err(MemoryError::from)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Idempotent upsert. A second active decision for the same
    /// (target, namespace) trips the unique partial index and surfaces as
    /// a [`MemoryError::Conflict`].
    pub fn upsert(&self, row: &MetaRow) -> Result<()> {
        let content = truncate_at_boundary(&row.content, CONTENT_CACHE_LIMIT);

        let res = self.write_conn().execute(
            "INSERT INTO semantic_meta (fid, target, title, status, kind, timestamp, \
             superseded_by, content, keywords, confidence, namespace, hit_count, last_hit_at, \
             context_json, phase, vitality, reinforcement_density, stability_score, coverage) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
             ON CONFLICT(fid) DO UPDATE SET \
                 target=excluded.target, \
                 title=excluded.title, \
                 status=excluded.status, \
                 superseded_by=excluded.superseded_by, \
                 content=excluded.content, \
                 keywords=excluded.keywords, \
                 confidence=excluded.confidence, \
                 namespace=excluded.namespace, \
                 context_json=excluded.context_json, \
                 phase=excluded.phase, \
                 vitality=excluded.vitality, \
                 reinforcement_density=excluded.reinforcement_density, \
                 stability_score=excluded.stability_score, \
                 coverage=excluded.coverage",
            params![
                row.fid,
                row.target,
                row.title,
                row.status,
                row.kind,
                row.timestamp,
                row.superseded_by,
                content,
                row.keywords,
                row.confidence,
                row.namespace,
                row.hit_count,
                row.last_hit_at,
                row.context_json,
                row.phase,
                row.vitality,
                row.reinforcement_density,
                row.stability_score,
                row.coverage,
            ],
        );

        match res {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(MemoryError::Conflict(format!(
                "CONFLICT: Target '{}' in namespace '{}' already has active decisions.",
                row.target, row.namespace
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a row
    pub fn delete(&self, fid: &str) -> Result<()> {
        self.write_conn()
            .execute("DELETE FROM semantic_meta WHERE fid = ?1", params![fid])?;
        Ok(())
    }

    /// Bump the retrieval counter and stamp the last hit time
    pub fn increment_hit(&self, fid: &str) -> Result<()> {
        self.write_conn().execute(
            "UPDATE semantic_meta SET hit_count = hit_count + 1, last_hit_at = ?2 WHERE fid = ?1",
            params![fid, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Fetch a row by artifact id
    pub fn get_by_fid(&self, fid: &str) -> Result<Option<MetaRow>> {
        let conn = self.read_conn();
        let row = conn
            .query_row(
                &format!("SELECT {ROW_COLUMNS} FROM semantic_meta WHERE fid = ?1"),
                params![fid],
                row_from,
            )
            .optional()?;
        Ok(row)
    }

    /// The single active decision for (target, namespace), when one exists
    pub fn get_active_fid(&self, target: &str, namespace: &str) -> Result<Option<String>> {
        let conn = self.read_conn();
        let fid = conn
            .query_row(
                "SELECT fid FROM semantic_meta WHERE target = ?1 AND namespace = ?2 \
                 AND status = 'active' AND kind = 'decision'",
                params![target, namespace],
                |r| r.get(0),
            )
            .optional()?;
        Ok(fid)
    }

    /// Every row in the index
    pub fn list_all(&self) -> Result<Vec<MetaRow>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM semantic_meta"))?;
        let rows = stmt
            .query_map([], row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Targets that currently hold an active decision
    pub fn list_active_targets(&self) -> Result<HashSet<String>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT target FROM semantic_meta \
             WHERE status = 'active' AND kind = 'decision'",
        )?;
        let targets = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(targets)
    }

    /// All draft proposals
    pub fn list_draft_proposals(&self) -> Result<Vec<MetaRow>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROW_COLUMNS} FROM semantic_meta WHERE kind = 'proposal' AND status = 'draft'"
        ))?;
        let rows = stmt
            .query_map([], row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Active decision fids for (target, namespace)
    pub fn list_active_conflicts(&self, target: &str, namespace: &str) -> Result<Vec<String>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT fid FROM semantic_meta WHERE target = ?1 AND namespace = ?2 \
             AND status = 'active' AND kind = 'decision'",
        )?;
        let fids = stmt
            .query_map(params![target, namespace], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fids)
    }

    /// Token-based LIKE search over target, fid, title, content, and
    /// keywords, newest first, scoped to one namespace.
    pub fn keyword_search(&self, query: &str, limit: usize, namespace: &str) -> Result<Vec<MetaRow>> {
        let words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|w| format!("%{w}%"))
            .collect();
        if words.is_empty() {
            return Ok(vec![]);
        }

        let conditions: Vec<String> = words
            .iter()
            .map(|_| {
                "(target LIKE ? OR fid LIKE ? OR title LIKE ? OR content LIKE ? OR keywords LIKE ?)"
                    .to_string()
            })
            .collect();
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM semantic_meta WHERE namespace = ? AND ({}) \
             ORDER BY timestamp DESC LIMIT ?",
            conditions.join(" OR ")
        );

        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::with_capacity(words.len() * 5 + 2);
        values.push(Box::new(namespace.to_string()));
        for word in &words {
            for _ in 0..5 {
                values.push(Box::new(word.clone()));
            }
        }
        values.push(Box::new(limit as i64));

        let conn = self.read_conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                row_from,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Follow `superseded_by` links to the head of the chain.
    ///
    /// Stops at the first active row, at a missing successor (returning the
    /// last existing row), immediately in audit mode, or after
    /// [`MAX_RESOLVE_DEPTH`] hops (returning `None`).
    pub fn resolve_to_truth(&self, fid: &str, audit_mode: bool) -> Result<Option<MetaRow>> {
        let mut current = fid.to_string();
        let mut last_good: Option<MetaRow> = None;

        for _ in 0..MAX_RESOLVE_DEPTH {
            let Some(row) = self.get_by_fid(&current)? else {
                return Ok(last_good);
            };
            let successor = row.superseded_by.clone();
            if audit_mode || row.status == "active" || successor.is_none() {
                return Ok(Some(row));
            }
            last_good = Some(row);
            current = successor.unwrap_or_default();
        }
        tracing::warn!(
            fid,
            "truth resolution depth limit ({MAX_RESOLVE_DEPTH}) reached; possible circularity"
        );
        Ok(None)
    }

    // ========================================================================
    // CONFIG K/V
    // ========================================================================

    /// Read a process-wide config value (watermarks, schema version)
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.read_conn();
        let value = conn
            .query_row(
                "SELECT value FROM sys_config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a process-wide config value
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.write_conn().execute(
            "INSERT OR REPLACE INTO sys_config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_row(fid: &str, target: &str, status: &str) -> MetaRow {
        MetaRow {
            fid: fid.into(),
            target: target.into(),
            title: format!("Title for {target}"),
            status: status.into(),
            kind: "decision".into(),
            timestamp: Utc::now().to_rfc3339(),
            superseded_by: None,
            content: "cached body".into(),
            keywords: String::new(),
            confidence: 1.0,
            namespace: "default".into(),
            hit_count: 0,
            last_hit_at: None,
            context_json: "{}".into(),
            phase: "pattern".into(),
            vitality: "active".into(),
            reinforcement_density: 0.0,
            stability_score: 0.0,
            coverage: 0.0,
        }
    }

    fn open_store() -> (TempDir, SemanticMetaStore) {
        let dir = TempDir::new().unwrap();
        let store = SemanticMetaStore::open(dir.path().join("semantic_meta.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_upsert_and_fetch() {
        let (_dir, store) = open_store();
        store.upsert(&test_row("a.md", "style", "active")).unwrap();
        let row = store.get_by_fid("a.md").unwrap().unwrap();
        assert_eq!(row.target, "style");
        assert_eq!(store.get_active_fid("style", "default").unwrap().unwrap(), "a.md");
    }

    #[test]
    fn test_unique_active_maps_to_conflict() {
        let (_dir, store) = open_store();
        store.upsert(&test_row("a.md", "style", "active")).unwrap();
        let err = store.upsert(&test_row("b.md", "style", "active")).unwrap_err();
        assert!(err.is_conflict(), "expected conflict, got {err:?}");

        // A different namespace is fine
        let mut other = test_row("c.md", "style", "active");
        other.namespace = "prod".into();
        store.upsert(&other).unwrap();
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (_dir, store) = open_store();
        let row = test_row("a.md", "style", "active");
        store.upsert(&row).unwrap();
        store.upsert(&row).unwrap();
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_keyword_search_ranks_and_scopes() {
        let (_dir, store) = open_store();
        store.upsert(&test_row("a.md", "style", "active")).unwrap();
        let mut other_ns = test_row("b.md", "style_remote", "active");
        other_ns.namespace = "prod".into();
        store.upsert(&other_ns).unwrap();

        let hits = store.keyword_search("style", 10, "default").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fid, "a.md");

        let hits = store.keyword_search("style", 10, "prod").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fid, "b.md");
    }

    #[test]
    fn test_resolve_to_truth_chain() {
        let (_dir, store) = open_store();
        let mut a = test_row("a.md", "style", "superseded");
        a.superseded_by = Some("b.md".into());
        store.upsert(&a).unwrap();
        let mut b = test_row("b.md", "style", "superseded");
        b.superseded_by = Some("c.md".into());
        store.upsert(&b).unwrap();
        store.upsert(&test_row("c.md", "style", "active")).unwrap();

        let head = store.resolve_to_truth("a.md", false).unwrap().unwrap();
        assert_eq!(head.fid, "c.md");

        // Audit mode stops at the first hop
        let audit = store.resolve_to_truth("a.md", true).unwrap().unwrap();
        assert_eq!(audit.fid, "a.md");
    }

    #[test]
    fn test_resolve_dangling_returns_last_existing() {
        let (_dir, store) = open_store();
        let mut a = test_row("a.md", "style", "superseded");
        a.superseded_by = Some("missing.md".into());
        store.upsert(&a).unwrap();

        let row = store.resolve_to_truth("a.md", false).unwrap().unwrap();
        assert_eq!(row.fid, "a.md");

        assert!(store.resolve_to_truth("missing.md", false).unwrap().is_none());
    }

    #[test]
    fn test_savepoint_rollback_discards_writes() {
        let (_dir, store) = open_store();
        store.savepoint_begin().unwrap();
        store.upsert(&test_row("a.md", "style", "active")).unwrap();
        // Mid-transaction reads observe the uncommitted row
        assert!(store.get_by_fid("a.md").unwrap().is_some());
        store.savepoint_rollback().unwrap();
        assert!(store.get_by_fid("a.md").unwrap().is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let (_dir, store) = open_store();
        assert!(store.get_config("last_reflection_event_id").unwrap().is_none());
        store.set_config("last_reflection_event_id", "42").unwrap();
        assert_eq!(
            store.get_config("last_reflection_event_id").unwrap().unwrap(),
            "42"
        );
    }

    #[test]
    fn test_increment_hit_stamps_time() {
        let (_dir, store) = open_store();
        store.upsert(&test_row("a.md", "style", "active")).unwrap();
        store.increment_hit("a.md").unwrap();
        let row = store.get_by_fid("a.md").unwrap().unwrap();
        assert_eq!(row.hit_count, 1);
        assert!(row.last_hit_at.is_some());
    }
}
