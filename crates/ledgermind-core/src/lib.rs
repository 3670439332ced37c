//! # Ledgermind Core
//!
//! Agent memory engine: a durable, auditable, content-addressed knowledge
//! store that evolves under concurrent access by autonomous agents.
//!
//! Two coupled stores back the engine:
//!
//! - **Episodic log**: a high-volume append-only record of everything that
//!   happened (prompts, tool calls, results, errors, commits), with
//!   duplicate suppression and age-based decay. Events linked to semantic
//!   records are immortal.
//! - **Semantic graph**: a small, curated set of decisions, constraints,
//!   and proposals persisted as front-matter artifacts on a git-audited
//!   filesystem, indexed relationally and vectorized for retrieval. A
//!   single active decision per (target, namespace) is enforced at both
//!   the index and the integrity-scan level, and knowledge evolves through
//!   bidirectional supersede chains that stay acyclic.
//!
//! On top sit the evolution engines: similarity-based conflict
//! auto-resolution with optional arbitration, confidence decay, lifecycle
//! promotion of decision streams, and an incremental reflection engine
//! that distills trajectories, generates competing hypotheses, and
//! auto-accepts the ones that survive their evidence.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ledgermind_core::prelude::*;
//!
//! let config = MemoryConfig {
//!     storage_path: Some("./memory".into()),
//!     ..Default::default()
//! };
//! let memory = Memory::open(config)?;
//!
//! // Record a decision
//! let decision = memory.record_decision(
//!     "Use tabs",
//!     "style",
//!     "Align with team convention.",
//!     None, None, None, None,
//! )?;
//!
//! // Evolve it later
//! memory.supersede_decision(
//!     "Use spaces",
//!     "style",
//!     "Switching to spaces per ADR-42.",
//!     &[decision.file_id().unwrap().to_string()],
//!     None, None, None,
//! )?;
//!
//! // Hybrid ranked retrieval
//! let results = memory.search_decisions("spaces", 5, 0, None, SearchMode::Strict)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local ONNX embedding generation via fastembed
//! - `vector-search` (default): HNSW approximate-nearest-neighbor index
//! - `bundled-sqlite` (default): bundled SQLite build
//! - `full`: everything

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod embeddings;
pub mod error;
pub mod memory;
pub mod reasoning;
pub mod router;
pub mod schema;
pub mod search;
pub mod storage;
pub mod targets;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use error::{MemoryError, Result};

pub use schema::{
    ArtifactStatus, DecisionContext, DecisionPhase, DecisionStream, DecisionVitality,
    EventContext, EventKind, EventSource, EventStatus, MemoryConfig, MemoryDecision, MemoryEvent,
    PatternScope, ProceduralContent, ProceduralStep, ProposalContext, ProposalStatus,
    ResolutionIntent, ResolutionType, StoreType, TrustBoundary,
};

pub use memory::{
    Arbiter, ArbiterCandidate, EnvironmentReport, EventBus, MaintenanceLoop, MaintenanceReport,
    Memory, MemoryNotification, MemoryStats, SearchMode, SearchResult,
};

pub use router::MemoryRouter;

pub use storage::{
    AuditBackend, AuditCommit, EpisodicEvent, EpisodicStore, FileSystemLock, GitAuditBackend,
    IntegrityChecker, LockMode, MetaRow, NullAuditBackend, SemanticMetaStore, SemanticStore,
    TransactionManager,
};

pub use reasoning::{
    ConflictEngine, DecayEngine, DecayReport, DistillationEngine, GitIndexer, LifecycleEngine,
    MergeEngine, ReflectionEngine, ReflectionPolicy, ResolutionEngine,
};

pub use search::{reciprocal_rank_fusion, Document, VectorHit, VectorStore};

pub use embeddings::{cosine_similarity, EmbeddingError, HashingEmbedder, TextEmbedder};
#[cfg(feature = "embeddings")]
pub use embeddings::LocalEmbedder;

pub use targets::TargetRegistry;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        DecayReport, EventContext, EventKind, EventSource, Memory, MemoryConfig, MemoryDecision,
        MemoryError, MemoryEvent, ResolutionIntent, ResolutionType, Result, SearchMode,
        SearchResult, TrustBoundary,
    };

    pub use crate::{HashingEmbedder, TextEmbedder};

    #[cfg(feature = "embeddings")]
    pub use crate::LocalEmbedder;
}
