//! Conflict detection and resolution-intent validation.
//!
//! A conflict exists when a decision event targets a (target, namespace)
//! that already holds an active decision. Detection runs twice per write:
//! optimistically before the lock and again inside the transaction to
//! close the race window.

use std::sync::Arc;

use crate::error::Result;
use crate::schema::{EventKind, MemoryEvent, ResolutionIntent, ResolutionType};
use crate::storage::SemanticMetaStore;

/// Detects active-target conflicts through the metadata index
pub struct ConflictEngine {
    meta: Arc<SemanticMetaStore>,
}

impl ConflictEngine {
    /// Build an engine over the metadata index
    pub fn new(meta: Arc<SemanticMetaStore>) -> Self {
        Self { meta }
    }

    /// Active decision files conflicting with this event, if any.
    ///
    /// Only decision events conflict; the explicit namespace argument wins
    /// over the event's own.
    pub fn get_conflict_files(&self, event: &MemoryEvent, namespace: &str) -> Result<Vec<String>> {
        if event.kind != EventKind::Decision {
            return Ok(vec![]);
        }
        let Some(target) = event.context.target() else {
            return Ok(vec![]);
        };
        let effective_ns = if namespace.is_empty() {
            event
                .context
                .namespace()
                .unwrap_or_else(|| "default".to_string())
        } else {
            namespace.to_string()
        };
        match self.meta.get_active_fid(&target, &effective_ns)? {
            Some(fid) => Ok(vec![fid]),
            None => Ok(vec![]),
        }
    }

    /// Human-readable conflict message, when a conflict exists
    pub fn check_for_conflicts(
        &self,
        event: &MemoryEvent,
        namespace: &str,
    ) -> Result<Option<String>> {
        let files = self.get_conflict_files(event, namespace)?;
        if files.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("Conflict detected with: {}", files.join(", "))))
        }
    }
}

/// Validates declared resolution plans against detected conflicts
#[derive(Default)]
pub struct ResolutionEngine;

impl ResolutionEngine {
    /// Build the engine
    pub fn new() -> Self {
        Self
    }

    /// An intent is valid iff it is not an abort and covers every
    /// conflicting file.
    pub fn validate_intent(&self, intent: &ResolutionIntent, conflict_files: &[String]) -> bool {
        if intent.resolution_type == ResolutionType::Abort {
            return false;
        }
        conflict_files
            .iter()
            .all(|f| intent.target_decision_ids.contains(f))
    }
}
