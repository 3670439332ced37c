//! Memory events, routing decisions, and resolution intents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::{MemoryError, Result};
use crate::schema::context::EventContext;
use crate::schema::sanitize::sanitize_content;

// ============================================================================
// SOURCES AND KINDS
// ============================================================================

/// Who produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// A human operator
    User,
    /// An autonomous agent
    Agent,
    /// The engine itself
    System,
    /// The reflection engine
    ReflectionEngine,
    /// An external bridge process
    Bridge,
}

impl EventSource {
    /// String form used in episodic rows
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::User => "user",
            EventSource::Agent => "agent",
            EventSource::System => "system",
            EventSource::ReflectionEngine => "reflection_engine",
            EventSource::Bridge => "bridge",
        }
    }

    /// Parse from an episodic row value
    pub fn parse_name(s: &str) -> Self {
        match s {
            "user" => EventSource::User,
            "system" => EventSource::System,
            "reflection_engine" => EventSource::ReflectionEngine,
            "bridge" => EventSource::Bridge,
            _ => EventSource::Agent,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of thing happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An explicit committed decision
    Decision,
    /// A failure observation
    Error,
    /// A configuration change
    ConfigChange,
    /// A working assumption
    Assumption,
    /// A hard constraint
    Constraint,
    /// An operation outcome
    Result,
    /// A machine-generated hypothesis
    Proposal,
    /// A snapshot of working context
    ContextSnapshot,
    /// Context injected into an agent
    ContextInjection,
    /// A unit of planned work
    Task,
    /// A tool or function call
    Call,
    /// A version-control commit
    CommitChange,
    /// A user prompt
    Prompt,
    /// A manual correction by an operator
    Intervention,
    /// A summary produced by reflection
    ReflectionSummary,
}

impl EventKind {
    /// String form used in rows and artifact front-matter
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Decision => "decision",
            EventKind::Error => "error",
            EventKind::ConfigChange => "config_change",
            EventKind::Assumption => "assumption",
            EventKind::Constraint => "constraint",
            EventKind::Result => "result",
            EventKind::Proposal => "proposal",
            EventKind::ContextSnapshot => "context_snapshot",
            EventKind::ContextInjection => "context_injection",
            EventKind::Task => "task",
            EventKind::Call => "call",
            EventKind::CommitChange => "commit_change",
            EventKind::Prompt => "prompt",
            EventKind::Intervention => "intervention",
            EventKind::ReflectionSummary => "reflection_summary",
        }
    }

    /// Parse from a row value; unknown kinds become results
    pub fn parse_name(s: &str) -> Self {
        match s {
            "decision" => EventKind::Decision,
            "error" => EventKind::Error,
            "config_change" => EventKind::ConfigChange,
            "assumption" => EventKind::Assumption,
            "constraint" => EventKind::Constraint,
            "proposal" => EventKind::Proposal,
            "context_snapshot" => EventKind::ContextSnapshot,
            "context_injection" => EventKind::ContextInjection,
            "task" => EventKind::Task,
            "call" => EventKind::Call,
            "commit_change" => EventKind::CommitChange,
            "prompt" => EventKind::Prompt,
            "intervention" => EventKind::Intervention,
            "reflection_summary" => EventKind::ReflectionSummary,
            _ => EventKind::Result,
        }
    }

    /// Kinds that route to the semantic store
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            EventKind::Decision
                | EventKind::Constraint
                | EventKind::Assumption
                | EventKind::Proposal
                | EventKind::Intervention
        )
    }

    /// Kinds whose episodic rows are never pruned by decay
    pub fn is_protected(&self) -> bool {
        matches!(self, EventKind::Decision | EventKind::Constraint)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Episodic row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Live and queryable by default
    #[default]
    Active,
    /// Aged out but retained
    Archived,
}

impl EventStatus {
    /// String form used in episodic rows
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Archived => "archived",
        }
    }
}

// ============================================================================
// TRUST BOUNDARY
// ============================================================================

/// Process-wide policy on who may write semantic records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustBoundary {
    /// Agents may write when they declare a resolution intent
    #[default]
    AgentWithIntent,
    /// Only human-originated semantic writes are accepted
    HumanOnly,
}

// ============================================================================
// MEMORY EVENT
// ============================================================================

/// One episodic unit flowing through the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// Schema version for forward migration
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Producer
    pub source: EventSource,
    /// Kind of occurrence
    pub kind: EventKind,
    /// Sanitized free-text payload
    pub content: String,
    /// Typed or free-form context body
    #[serde(default)]
    pub context: EventContext,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    1
}

impl MemoryEvent {
    /// Build a validated event: content is sanitized and, for semantic
    /// kinds, the context map is narrowed to its typed variant.
    pub fn new(
        source: EventSource,
        kind: EventKind,
        content: &str,
        context: Option<EventContext>,
    ) -> Result<Self> {
        let content = sanitize_content(content)?;
        let context = match context {
            Some(EventContext::Map(map)) if kind.is_semantic() => {
                EventContext::narrow(map, kind == EventKind::Proposal)?
            }
            Some(ctx) => ctx,
            None if kind.is_semantic() => {
                return Err(MemoryError::Validation(format!(
                    "Semantic kind '{kind}' requires a typed context"
                )));
            }
            None => EventContext::default(),
        };
        Ok(Self {
            schema_version: 1,
            source,
            kind,
            content,
            context,
            timestamp: Utc::now(),
        })
    }

    /// Canonical JSON of the context for duplicate detection.
    ///
    /// serde_json maps are key-ordered (BTreeMap), so the output is stable
    /// for identical logical contents.
    pub fn canonical_context(&self) -> String {
        self.context.to_value().to_string()
    }
}

// ============================================================================
// ROUTING DECISION
// ============================================================================

/// Where an event was (or was not) persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// The append-only event log
    Episodic,
    /// The curated decision graph
    Semantic,
    /// Not persisted
    None,
}

/// Outcome of routing plus persistence metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDecision {
    /// Whether the event was persisted
    pub should_persist: bool,
    /// Which store received it
    pub store_type: StoreType,
    /// Human-readable reason
    pub reason: String,
    /// Routing priority, 0-10
    #[serde(default)]
    pub priority: u8,
    /// `file_id` for semantic writes, `event_id` for episodic writes
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl MemoryDecision {
    /// A non-persisting decision with the given reason
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            should_persist: false,
            store_type: StoreType::None,
            reason: reason.into(),
            priority: 0,
            metadata: serde_json::Map::new(),
        }
    }

    /// A persisting decision for the given store
    pub fn accepted(store_type: StoreType, reason: impl Into<String>) -> Self {
        Self {
            should_persist: true,
            store_type,
            reason: reason.into(),
            priority: 0,
            metadata: serde_json::Map::new(),
        }
    }

    /// The semantic artifact id recorded in metadata, when present
    pub fn file_id(&self) -> Option<&str> {
        self.metadata.get("file_id").and_then(|v| v.as_str())
    }

    /// The episodic event id recorded in metadata, when present
    pub fn event_id(&self) -> Option<i64> {
        self.metadata.get("event_id").and_then(|v| v.as_i64())
    }
}

// ============================================================================
// RESOLUTION INTENT
// ============================================================================

/// How a client intends to resolve an active-target conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionType {
    /// Replace the named decisions
    Supersede,
    /// Mark the named decisions deprecated
    Deprecate,
    /// Give up
    Abort,
}

/// A declared plan to resolve a conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionIntent {
    /// Kind of resolution
    pub resolution_type: ResolutionType,
    /// Why (min 15 chars)
    pub rationale: String,
    /// The decisions being resolved
    pub target_decision_ids: Vec<String>,
}

impl ResolutionIntent {
    /// Build a validated intent
    pub fn new(
        resolution_type: ResolutionType,
        rationale: impl Into<String>,
        target_decision_ids: Vec<String>,
    ) -> Result<Self> {
        let rationale = rationale.into();
        if rationale.trim().len() < 15 {
            return Err(MemoryError::Validation(
                "Resolution rationale must be at least 15 characters".into(),
            ));
        }
        if target_decision_ids.is_empty() {
            return Err(MemoryError::Validation(
                "Resolution intent requires at least one target decision".into(),
            ));
        }
        Ok(Self {
            resolution_type,
            rationale,
            target_decision_ids,
        })
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Engine configuration with storage-layout and decay knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Repository root; `None` selects the platform data directory
    pub storage_path: Option<PathBuf>,
    /// Episodic time-to-live in days
    pub ttl_days: i64,
    /// Who may write semantic records
    pub trust_boundary: TrustBoundary,
    /// Default namespace for this handle
    pub namespace: String,
    /// Whether the versioned audit backend is enabled
    pub enable_audit: bool,
    /// Base semantic decay per 7-day step
    pub semantic_decay_rate: f64,
    /// Confidence below which records are physically forgotten
    pub forget_threshold: f64,
    /// Confidence below which active decisions become deprecated
    pub deprecate_threshold: f64,
    /// Minimum similarity treated as relevant in retrieval
    pub relevance_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            ttl_days: 30,
            trust_boundary: TrustBoundary::AgentWithIntent,
            namespace: "default".to_string(),
            enable_audit: true,
            semantic_decay_rate: 0.05,
            forget_threshold: 0.1,
            deprecate_threshold: 0.5,
            relevance_threshold: 0.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in [
            EventKind::Decision,
            EventKind::Error,
            EventKind::ConfigChange,
            EventKind::CommitChange,
            EventKind::ReflectionSummary,
        ] {
            assert_eq!(EventKind::parse_name(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_semantic_kind_classification() {
        assert!(EventKind::Decision.is_semantic());
        assert!(EventKind::Proposal.is_semantic());
        assert!(EventKind::Intervention.is_semantic());
        assert!(!EventKind::Result.is_semantic());
        assert!(!EventKind::CommitChange.is_semantic());
    }

    #[test]
    fn test_event_requires_typed_context_for_semantic_kind() {
        let err = MemoryEvent::new(EventSource::Agent, EventKind::Decision, "content", None);
        assert!(err.is_err());

        let ok = MemoryEvent::new(
            EventSource::Agent,
            EventKind::Decision,
            "content",
            Some(EventContext::Map(json!({
                "title": "T", "target": "style", "rationale": "Align with team."
            }))),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_canonical_context_is_key_ordered() {
        let a = MemoryEvent::new(
            EventSource::User,
            EventKind::Result,
            "done",
            Some(EventContext::Map(json!({"b": 1, "a": 2}))),
        )
        .unwrap();
        assert_eq!(a.canonical_context(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_intent_rationale_length() {
        let short = ResolutionIntent::new(
            ResolutionType::Supersede,
            "too short here",
            vec!["x.md".into()],
        );
        assert!(short.is_err()); // 14 chars

        let ok = ResolutionIntent::new(
            ResolutionType::Supersede,
            "long enough now.",
            vec!["x.md".into()],
        );
        assert!(ok.is_ok()); // 16 chars
    }

    #[test]
    fn test_intent_requires_targets() {
        let none = ResolutionIntent::new(
            ResolutionType::Deprecate,
            "a perfectly valid rationale",
            vec![],
        );
        assert!(none.is_err());
    }
}
