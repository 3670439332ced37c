//! Append-only episodic event log.
//!
//! High-volume store keyed by autoincrement id. Events linked to a semantic
//! artifact are immortal: `physical_prune` refuses to remove them (I2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::schema::MemoryEvent;

/// SQLite bind-parameter budget per chunked IN query
const IN_CHUNK_SIZE: usize = 900;

// ============================================================================
// ROW TYPE
// ============================================================================

/// One episodic row
#[derive(Debug, Clone)]
pub struct EpisodicEvent {
    /// Monotonic id
    pub id: i64,
    /// Producer name
    pub source: String,
    /// Kind name
    pub kind: String,
    /// Sanitized payload
    pub content: String,
    /// Context map
    pub context: Value,
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// active | archived
    pub status: String,
    /// Semantic artifact this event grounds, when linked
    pub linked_id: Option<String>,
    /// Strength of the link
    pub link_strength: f64,
}

impl EpisodicEvent {
    /// Read a string field from the context map
    pub fn context_str(&self, field: &str) -> Option<&str> {
        self.context.get(field).and_then(|v| v.as_str())
    }
}

fn event_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodicEvent> {
    let context_raw: String = row.get(4)?;
    Ok(EpisodicEvent {
        id: row.get(0)?,
        source: row.get(1)?,
        kind: row.get(2)?,
        content: row.get(3)?,
        context: serde_json::from_str(&context_raw).unwrap_or(Value::Null),
        timestamp: row.get(5)?,
        status: row.get(6)?,
        linked_id: row.get(7)?,
        link_strength: row.get(8)?,
    })
}

const EVENT_COLUMNS: &str =
    "id, source, kind, content, context, timestamp, status, linked_id, link_strength";

// ============================================================================
// STORE
// ============================================================================

/// Append-only event log backed by SQLite
pub struct EpisodicStore {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl EpisodicStore {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;",
        )?;
        Ok(())
    }

    /// Open or create the log at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(&db_path)?;
        Self::configure_connection(&writer)?;
        writer.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT,
                kind TEXT,
                content TEXT,
                context TEXT,
                timestamp TEXT,
                status TEXT DEFAULT 'active',
                linked_id TEXT DEFAULT NULL,
                link_strength REAL DEFAULT 1.0
            );
            CREATE INDEX IF NOT EXISTS idx_events_duplicate
                ON events (source, kind, content, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_linked ON events (linked_id);",
        )?;
        let reader = Connection::open(&db_path)?;
        Self::configure_connection(&reader)?;
        Ok(Self {
            db_path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn write_conn(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an event, returning its id.
    ///
    /// A last-resort duplicate check returns the existing id instead of
    /// inserting twice.
    pub fn append(
        &self,
        event: &MemoryEvent,
        linked_id: Option<&str>,
        link_strength: f64,
    ) -> Result<i64> {
        if let Some(existing) = self.find_duplicate(event, linked_id, false)? {
            return Ok(existing);
        }
        let context_json = event.canonical_context();
        let conn = self.write_conn();
        conn.execute(
            "INSERT INTO events (source, kind, content, context, timestamp, linked_id, link_strength) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.source.as_str(),
                event.kind.as_str(),
                event.content,
                context_json,
                event.timestamp.to_rfc3339(),
                linked_id,
                link_strength,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Check for an identical event tuple.
    ///
    /// Matches (source, kind, content, context, timestamp); unless
    /// `ignore_links`, the linked id must match too (NULL matches NULL).
    pub fn find_duplicate(
        &self,
        event: &MemoryEvent,
        linked_id: Option<&str>,
        ignore_links: bool,
    ) -> Result<Option<i64>> {
        let context_json = event.canonical_context();
        let timestamp = event.timestamp.to_rfc3339();

        let conn = self.read_conn();
        let mut sql = String::from(
            "SELECT id FROM events WHERE source = ?1 AND kind = ?2 AND content = ?3 \
             AND context = ?4 AND timestamp = ?5",
        );
        let id = if ignore_links {
            sql.push_str(" LIMIT 1");
            conn.query_row(
                &sql,
                params![
                    event.source.as_str(),
                    event.kind.as_str(),
                    event.content,
                    context_json,
                    timestamp
                ],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
        } else if let Some(lid) = linked_id {
            sql.push_str(" AND linked_id = ?6 LIMIT 1");
            conn.query_row(
                &sql,
                params![
                    event.source.as_str(),
                    event.kind.as_str(),
                    event.content,
                    context_json,
                    timestamp,
                    lid
                ],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
        } else {
            sql.push_str(" AND linked_id IS NULL LIMIT 1");
            conn.query_row(
                &sql,
                params![
                    event.source.as_str(),
                    event.kind.as_str(),
                    event.content,
                    context_json,
                    timestamp
                ],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
        };
        Ok(id)
    }

    /// Link an event to a semantic artifact
    pub fn link_to_semantic(&self, event_id: i64, semantic_id: &str, strength: f64) -> Result<()> {
        self.write_conn().execute(
            "UPDATE events SET linked_id = ?1, link_strength = ?2 WHERE id = ?3",
            params![semantic_id, strength, event_id],
        )?;
        Ok(())
    }

    /// Clear the link for every event pointing at this artifact
    pub fn unlink_all_for_semantic(&self, semantic_id: &str) -> Result<()> {
        self.write_conn().execute(
            "UPDATE events SET linked_id = NULL WHERE linked_id = ?1",
            params![semantic_id],
        )?;
        Ok(())
    }

    /// Fetch events by id, ascending
    pub fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<EpisodicEvent>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut out = Vec::with_capacity(ids.len());
        let conn = self.read_conn();
        for chunk in ids.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE id IN ({placeholders}) ORDER BY id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk.iter()), event_from)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            out.extend(rows);
        }
        Ok(out)
    }

    /// Query the log with optional status and id filters
    pub fn query(
        &self,
        limit: usize,
        status: Option<&str>,
        after_id: Option<i64>,
        ascending: bool,
    ) -> Result<Vec<EpisodicEvent>> {
        let mut conditions = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = status {
            conditions.push("status = ?");
            values.push(Box::new(s.to_string()));
        }
        if let Some(id) = after_id {
            conditions.push("id > ?");
            values.push(Box::new(id));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let direction = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events {where_clause} ORDER BY id {direction} LIMIT ?"
        );
        values.push(Box::new(limit as i64));

        let conn = self.read_conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
                event_from,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ids of all events linked to the given artifact
    pub fn get_linked_event_ids(&self, semantic_id: &str) -> Result<Vec<i64>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare("SELECT id FROM events WHERE linked_id = ?1")?;
        let ids = stmt
            .query_map(params![semantic_id], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Batch variant of [`Self::get_linked_event_ids`]
    pub fn get_linked_event_ids_batch(
        &self,
        semantic_ids: &[String],
    ) -> Result<HashMap<String, Vec<i64>>> {
        let mut out: HashMap<String, Vec<i64>> =
            semantic_ids.iter().map(|s| (s.clone(), vec![])).collect();
        if semantic_ids.is_empty() {
            return Ok(out);
        }
        let conn = self.read_conn();
        for chunk in semantic_ids.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql =
                format!("SELECT linked_id, id FROM events WHERE linked_id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (linked, id) = row?;
                out.entry(linked).or_default().push(id);
            }
        }
        Ok(out)
    }

    /// (count, total strength) of links to the given artifact
    pub fn count_links_for_semantic(&self, semantic_id: &str) -> Result<(i64, f64)> {
        let conn = self.read_conn();
        let row = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(link_strength), 0.0) FROM events WHERE linked_id = ?1",
            params![semantic_id],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)),
        )?;
        Ok(row)
    }

    /// Batch variant of [`Self::count_links_for_semantic`]
    pub fn count_links_for_semantic_batch(
        &self,
        semantic_ids: &[String],
    ) -> Result<HashMap<String, (i64, f64)>> {
        let mut out: HashMap<String, (i64, f64)> = semantic_ids
            .iter()
            .map(|s| (s.clone(), (0, 0.0)))
            .collect();
        if semantic_ids.is_empty() {
            return Ok(out);
        }
        let conn = self.read_conn();
        for chunk in semantic_ids.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT linked_id, COUNT(*), COALESCE(SUM(link_strength), 0.0) \
                 FROM events WHERE linked_id IN ({placeholders}) GROUP BY linked_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, f64>(2)?))
            })?;
            for row in rows {
                let (linked, count, strength) = row?;
                out.insert(linked, (count, strength));
            }
        }
        Ok(out)
    }

    /// Flip the given events to archived
    pub fn mark_archived(&self, event_ids: &[i64]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let conn = self.write_conn();
        for chunk in event_ids.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("UPDATE events SET status = 'archived' WHERE id IN ({placeholders})");
            conn.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(())
    }

    /// Physically remove the given events.
    ///
    /// Rows with a non-null `linked_id` are skipped: immortal episodes back
    /// semantic records (I2), re-checked here at execution time.
    pub fn physical_prune(&self, event_ids: &[i64]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let conn = self.write_conn();
        for chunk in event_ids.chunks(IN_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "DELETE FROM events WHERE id IN ({placeholders}) AND linked_id IS NULL"
            );
            conn.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }
        Ok(())
    }

    /// Number of events, optionally filtered by status
    pub fn count_events(&self, status: Option<&str>) -> Result<i64> {
        let conn = self.read_conn();
        let count = match status {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE status = ?1",
                params![s],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?,
        };
        Ok(count)
    }
}
