//! Typed event contexts.
//!
//! Semantic events carry one of three typed bodies; everything else keeps a
//! free-form JSON map. Narrowing from a raw map happens at the schema layer
//! so the rest of the engine never duck-types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MemoryError, Result};

// ============================================================================
// LIFECYCLE ENUMS
// ============================================================================

/// Phase of a decision stream: pattern -> emergent -> canonical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionPhase {
    /// Raw behavioral pattern, not yet crystallized
    #[default]
    Pattern,
    /// Reinforced enough to matter
    Emergent,
    /// Stable, high-cost-to-remove knowledge
    Canonical,
}

impl DecisionPhase {
    /// String form used in metadata rows
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPhase::Pattern => "pattern",
            DecisionPhase::Emergent => "emergent",
            DecisionPhase::Canonical => "canonical",
        }
    }

    /// Parse from a metadata row value; unknown values fall back to pattern
    pub fn parse_name(s: &str) -> Self {
        match s {
            "emergent" => DecisionPhase::Emergent,
            "canonical" => DecisionPhase::Canonical,
            _ => DecisionPhase::Pattern,
        }
    }

    /// Ranking weight applied during search rescoring
    pub fn weight(&self) -> f32 {
        match self {
            DecisionPhase::Canonical => 1.5,
            DecisionPhase::Emergent => 1.2,
            DecisionPhase::Pattern => 1.0,
        }
    }
}

/// Vitality of a decision stream, decaying with inactivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionVitality {
    /// Seen within the last week
    #[default]
    Active,
    /// Inactive for over a week
    Decaying,
    /// Inactive for over a month
    Dormant,
}

impl DecisionVitality {
    /// String form used in metadata rows
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionVitality::Active => "active",
            DecisionVitality::Decaying => "decaying",
            DecisionVitality::Dormant => "dormant",
        }
    }

    /// Parse from a metadata row value; unknown values fall back to active
    pub fn parse_name(s: &str) -> Self {
        match s {
            "decaying" => DecisionVitality::Decaying,
            "dormant" => DecisionVitality::Dormant,
            _ => DecisionVitality::Active,
        }
    }

    /// Ranking weight applied during search rescoring
    pub fn weight(&self) -> f32 {
        match self {
            DecisionVitality::Active => 1.0,
            DecisionVitality::Decaying => 0.5,
            DecisionVitality::Dormant => 0.2,
        }
    }
}

/// Blast radius of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternScope {
    /// Confined to one module or file
    #[default]
    Local,
    /// Affects the whole system
    System,
    /// Affects infrastructure
    Infra,
}

/// Proposal review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Pending review or automatic acceptance
    #[default]
    Draft,
    /// Converted into an active decision
    Accepted,
    /// Declined by a reviewer or by decay
    Rejected,
    /// Contradicted by subsequent evidence
    Falsified,
}

impl ProposalStatus {
    /// String form used in metadata rows
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Falsified => "falsified",
        }
    }
}

// ============================================================================
// PROCEDURAL KNOWLEDGE
// ============================================================================

/// One step in a distilled procedure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProceduralStep {
    /// What was done
    pub action: String,
    /// Why it was done, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// What the step was expected to produce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

/// Ordered procedure distilled from a successful trajectory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProceduralContent {
    /// Ordered steps
    pub steps: Vec<ProceduralStep>,
    /// Task the procedure accomplishes
    pub target_task: String,
    /// Episodic events witnessing the success
    pub success_evidence_ids: Vec<i64>,
}

// ============================================================================
// DECISION CONTEXT
// ============================================================================

/// Context body for decisions, constraints, assumptions, and interventions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    /// Short human title
    pub title: String,
    /// Normalized subject key (min 3 chars)
    pub target: String,
    /// active | deprecated | superseded
    #[serde(default = "default_active")]
    pub status: String,
    /// Why this decision was made (min 10 chars)
    pub rationale: String,
    /// Isolation scope
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Semantic keywords for better retrieval
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Episodic events grounding this decision
    #[serde(default)]
    pub evidence_event_ids: Vec<i64>,
    /// Downstream effects
    #[serde(default)]
    pub consequences: Vec<String>,
    /// Predecessor artifact ids
    #[serde(default)]
    pub supersedes: Vec<String>,
    /// Successor artifact id, when superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// Confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Associated procedural knowledge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedural: Option<ProceduralContent>,
}

fn default_active() -> String {
    "active".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

impl DecisionContext {
    /// Build a minimal active decision context
    pub fn new(title: impl Into<String>, target: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            target: target.into(),
            status: default_active(),
            rationale: rationale.into(),
            namespace: default_namespace(),
            keywords: vec![],
            evidence_event_ids: vec![],
            consequences: vec![],
            supersedes: vec![],
            superseded_by: None,
            confidence: 1.0,
            procedural: None,
        }
    }

    /// Enforce the field-length invariants
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(MemoryError::Validation("Title cannot be empty".into()));
        }
        if self.target.trim().len() < 3 {
            return Err(MemoryError::Validation(
                "Target must be at least 3 characters".into(),
            ));
        }
        if self.rationale.trim().len() < 10 {
            return Err(MemoryError::Validation(
                "Rationale must be at least 10 characters".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PROPOSAL CONTEXT
// ============================================================================

/// Context body for machine-generated hypotheses pending review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalContext {
    /// Short human title
    pub title: String,
    /// Normalized subject key (min 3 chars)
    pub target: String,
    /// Review status
    #[serde(default)]
    pub status: ProposalStatus,
    /// Why this hypothesis was formed (min 10 chars)
    pub rationale: String,
    /// Isolation scope
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Lifecycle phase
    #[serde(default)]
    pub phase: DecisionPhase,
    /// Lifecycle vitality
    #[serde(default)]
    pub vitality: DecisionVitality,
    /// Interval regularity score
    #[serde(default)]
    pub stability_score: f64,
    /// Reinforcement count
    #[serde(default = "default_frequency")]
    pub frequency: i64,
    /// Semantic keywords for better retrieval
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Arguments in favor of this hypothesis
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Active counter-arguments or missing evidence
    #[serde(default)]
    pub objections: Vec<String>,
    /// Scenarios where this hypothesis was expected to trigger but didn't
    #[serde(default)]
    pub counter_patterns: Vec<String>,
    /// Competing proposals over the same evidence cluster
    #[serde(default)]
    pub alternative_ids: Vec<String>,
    /// Supporting episodic events
    #[serde(default)]
    pub evidence_event_ids: Vec<i64>,
    /// Events that weaken this hypothesis
    #[serde(default)]
    pub counter_evidence_event_ids: Vec<i64>,
    /// Consequences the accepted decision would carry
    #[serde(default)]
    pub suggested_consequences: Vec<String>,
    /// Decisions the accepted decision would supersede
    #[serde(default)]
    pub suggested_supersedes: Vec<String>,
    /// Distilled procedural knowledge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedural: Option<ProceduralContent>,
    /// First supporting observation
    #[serde(default = "Utc::now")]
    pub first_observed_at: DateTime<Utc>,
    /// Most recent supporting observation
    #[serde(default = "Utc::now")]
    pub last_observed_at: DateTime<Utc>,
    /// Accumulated error observations
    #[serde(default)]
    pub hit_count: i64,
    /// Accumulated success observations
    #[serde(default)]
    pub miss_count: i64,
    /// True once the evidence clears the review bar
    #[serde(default)]
    pub ready_for_review: bool,
}

fn default_frequency() -> i64 {
    1
}

impl ProposalContext {
    /// Build a draft proposal with the given confidence
    pub fn new(
        title: impl Into<String>,
        target: impl Into<String>,
        rationale: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            title: title.into(),
            target: target.into(),
            status: ProposalStatus::Draft,
            rationale: rationale.into(),
            namespace: default_namespace(),
            confidence: confidence.clamp(0.0, 1.0),
            phase: DecisionPhase::Pattern,
            vitality: DecisionVitality::Active,
            stability_score: 0.0,
            frequency: 1,
            keywords: vec![],
            strengths: vec![],
            objections: vec![],
            counter_patterns: vec![],
            alternative_ids: vec![],
            evidence_event_ids: vec![],
            counter_evidence_event_ids: vec![],
            suggested_consequences: vec![],
            suggested_supersedes: vec![],
            procedural: None,
            first_observed_at: now,
            last_observed_at: now,
            hit_count: 0,
            miss_count: 0,
            ready_for_review: false,
        }
    }

    /// Enforce the field-length invariants and clamp confidence
    pub fn validate(&mut self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(MemoryError::Validation("Title cannot be empty".into()));
        }
        if self.target.trim().len() < 3 {
            return Err(MemoryError::Validation(
                "Target must be at least 3 characters".into(),
            ));
        }
        if self.rationale.trim().len() < 10 {
            return Err(MemoryError::Validation(
                "Rationale must be at least 10 characters".into(),
            ));
        }
        self.confidence = self.confidence.clamp(0.0, 1.0);
        Ok(())
    }
}

// ============================================================================
// DECISION STREAM
// ============================================================================

/// Lifecycle-aware view of a decision with temporal signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionStream {
    /// Stable stream id
    pub decision_id: String,
    /// Normalized subject key
    pub target: String,
    /// Short human title
    pub title: String,
    /// Why this stream exists
    pub rationale: String,
    /// Isolation scope
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Blast radius
    #[serde(default)]
    pub scope: PatternScope,
    /// active | deprecated | superseded
    #[serde(default = "default_active")]
    pub status: String,
    /// Lifecycle phase
    #[serde(default)]
    pub phase: DecisionPhase,
    /// Lifecycle vitality
    #[serde(default)]
    pub vitality: DecisionVitality,
    /// internal | external
    #[serde(default = "default_provenance")]
    pub provenance: String,
    /// Semantic keywords
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Supporting episodic events
    #[serde(default)]
    pub evidence_event_ids: Vec<i64>,
    /// Downstream effects
    #[serde(default)]
    pub consequences: Vec<String>,
    /// Predecessor artifact ids
    #[serde(default)]
    pub supersedes: Vec<String>,
    /// Successor artifact id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// Reinforcement count
    #[serde(default)]
    pub frequency: i64,
    /// Distinct contexts the pattern appeared in
    #[serde(default)]
    pub unique_contexts: i64,
    /// Retrieval count
    #[serde(default)]
    pub hit_count: i64,
    /// Confidence in [0, 1]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Interval regularity score
    #[serde(default)]
    pub stability_score: f64,
    /// Associated procedural knowledge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedural: Option<ProceduralContent>,
    /// First observation
    #[serde(default = "Utc::now")]
    pub first_seen: DateTime<Utc>,
    /// Latest observation
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// last_seen - first_seen in days
    #[serde(default)]
    pub lifetime_days: f64,
    /// frequency / lifetime
    #[serde(default)]
    pub reinforcement_density: f64,
    /// lifetime / observation window
    #[serde(default)]
    pub coverage: f64,
    /// Estimated cost of removing this knowledge, [0, 1]
    #[serde(default)]
    pub estimated_removal_cost: f64,
    /// Estimated usefulness, [0, 1]
    #[serde(default)]
    pub estimated_utility: f64,
    /// Schema version for forward migration
    #[serde(default = "default_stream_version")]
    pub schema_version: u32,
}

fn default_provenance() -> String {
    "internal".to_string()
}

fn default_stream_version() -> u32 {
    1
}

impl DecisionStream {
    /// Build a fresh pattern-phase stream
    pub fn new(target: impl Into<String>, title: impl Into<String>, rationale: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            title: title.into(),
            rationale: rationale.into(),
            namespace: default_namespace(),
            scope: PatternScope::Local,
            status: default_active(),
            phase: DecisionPhase::Pattern,
            vitality: DecisionVitality::Active,
            provenance: default_provenance(),
            keywords: vec![],
            evidence_event_ids: vec![],
            consequences: vec![],
            supersedes: vec![],
            superseded_by: None,
            frequency: 0,
            unique_contexts: 0,
            hit_count: 0,
            confidence: 1.0,
            stability_score: 0.0,
            procedural: None,
            first_seen: now,
            last_seen: now,
            lifetime_days: 0.0,
            reinforcement_density: 0.0,
            coverage: 0.0,
            estimated_removal_cost: 0.0,
            estimated_utility: 0.0,
            schema_version: 1,
        }
    }
}

// ============================================================================
// TAGGED EVENT CONTEXT
// ============================================================================

/// Tagged context attached to a memory event
///
/// Untagged variant order matters for deserialization: streams carry the
/// distinctive `decision_id`, proposals require `confidence`, decisions
/// require `rationale`; anything else lands in the free-form map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventContext {
    /// Lifecycle stream body
    Stream(Box<DecisionStream>),
    /// Proposal body
    Proposal(Box<ProposalContext>),
    /// Decision / constraint / assumption / intervention body
    Decision(Box<DecisionContext>),
    /// Free-form JSON map for episodic kinds
    Map(Value),
}

impl Default for EventContext {
    fn default() -> Self {
        EventContext::Map(Value::Object(serde_json::Map::new()))
    }
}

impl EventContext {
    /// Narrow a raw JSON map into the typed variant for a semantic kind.
    ///
    /// Presence of `decision_id` or `phase` selects a stream; the proposal
    /// kind selects a proposal; everything else becomes a decision body.
    pub fn narrow(value: Value, is_proposal_kind: bool) -> Result<Self> {
        let looks_like_stream = value
            .as_object()
            .is_some_and(|m| m.contains_key("decision_id") || m.contains_key("phase"));
        if looks_like_stream {
            let stream: DecisionStream = serde_json::from_value(value)
                .map_err(|e| MemoryError::Validation(format!("Invalid stream context: {e}")))?;
            return Ok(EventContext::Stream(Box::new(stream)));
        }
        if is_proposal_kind {
            let mut proposal: ProposalContext = serde_json::from_value(value)
                .map_err(|e| MemoryError::Validation(format!("Invalid proposal context: {e}")))?;
            proposal.validate()?;
            return Ok(EventContext::Proposal(Box::new(proposal)));
        }
        let decision: DecisionContext = serde_json::from_value(value)
            .map_err(|e| MemoryError::Validation(format!("Invalid decision context: {e}")))?;
        decision.validate()?;
        Ok(EventContext::Decision(Box::new(decision)))
    }

    /// Serialize to a JSON value (always a map for typed variants)
    pub fn to_value(&self) -> Value {
        match self {
            EventContext::Map(v) => v.clone(),
            other => serde_json::to_value(other).unwrap_or(Value::Null),
        }
    }

    /// Read a string field regardless of variant
    pub fn get_str(&self, field: &str) -> Option<String> {
        self.to_value()
            .get(field)
            .and_then(|v| v.as_str().map(String::from))
    }

    /// The target field, when present
    pub fn target(&self) -> Option<String> {
        match self {
            EventContext::Decision(d) => Some(d.target.clone()),
            EventContext::Proposal(p) => Some(p.target.clone()),
            EventContext::Stream(s) => Some(s.target.clone()),
            EventContext::Map(v) => v.get("target").and_then(|t| t.as_str().map(String::from)),
        }
    }

    /// The namespace field, when present
    pub fn namespace(&self) -> Option<String> {
        match self {
            EventContext::Decision(d) => Some(d.namespace.clone()),
            EventContext::Proposal(p) => Some(p.namespace.clone()),
            EventContext::Stream(s) => Some(s.namespace.clone()),
            EventContext::Map(v) => v.get("namespace").and_then(|t| t.as_str().map(String::from)),
        }
    }
}
