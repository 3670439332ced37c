//! Schema layer - typed records and validation.
//!
//! Everything entering the engine passes through here: events are
//! sanitized, semantic contexts are narrowed to typed bodies, and field
//! length invariants are enforced at construction time.

mod context;
mod event;
pub mod sanitize;

pub use context::{
    DecisionContext, DecisionPhase, DecisionStream, DecisionVitality, EventContext, PatternScope,
    ProceduralContent, ProceduralStep, ProposalContext, ProposalStatus,
};
pub use event::{
    EventKind, EventSource, EventStatus, MemoryConfig, MemoryDecision, MemoryEvent,
    ResolutionIntent, ResolutionType, StoreType, TrustBoundary,
};
pub use sanitize::{sanitize_content, validate_fid, validate_namespace, MAX_CONTENT_LENGTH};

/// Statuses a semantic artifact can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    /// The single committed truth for its (target, namespace)
    Active,
    /// Still visible but discouraged
    Deprecated,
    /// Replaced by a successor
    Superseded,
    /// Proposal pending review
    Draft,
    /// Proposal converted into a decision
    Accepted,
    /// Proposal declined
    Rejected,
    /// Proposal contradicted by evidence
    Falsified,
}

impl ArtifactStatus {
    /// String form used in metadata rows and front-matter
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Active => "active",
            ArtifactStatus::Deprecated => "deprecated",
            ArtifactStatus::Superseded => "superseded",
            ArtifactStatus::Draft => "draft",
            ArtifactStatus::Accepted => "accepted",
            ArtifactStatus::Rejected => "rejected",
            ArtifactStatus::Falsified => "falsified",
        }
    }

    /// Parse from a row value
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ArtifactStatus::Active),
            "deprecated" => Some(ArtifactStatus::Deprecated),
            "superseded" => Some(ArtifactStatus::Superseded),
            "draft" => Some(ArtifactStatus::Draft),
            "accepted" => Some(ArtifactStatus::Accepted),
            "rejected" => Some(ArtifactStatus::Rejected),
            "falsified" => Some(ArtifactStatus::Falsified),
            _ => None,
        }
    }

    /// Ranking multiplier applied during search rescoring
    pub fn search_multiplier(s: &str) -> f32 {
        match s {
            "active" => 1.5,
            "rejected" | "falsified" => 0.2,
            "superseded" | "deprecated" => 0.3,
            _ => 1.0,
        }
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
