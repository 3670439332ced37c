//! Knowledge evolution pipeline - conflict handling, decay, lifecycle,
//! distillation, reflection, merging, and history ingestion.

pub mod conflict;
pub mod decay;
pub mod distillation;
pub mod git_indexer;
pub mod lifecycle;
pub mod merging;
pub mod reflection;

pub use conflict::{ConflictEngine, ResolutionEngine};
pub use decay::{DecayEngine, DecayReport, SemanticDecay};
pub use distillation::DistillationEngine;
pub use git_indexer::{CommitInfo, GitIndexer, LAST_INDEXED_KEY};
pub use lifecycle::LifecycleEngine;
pub use merging::{MergeEngine, MERGE_THRESHOLD};
pub use reflection::{ReflectionEngine, ReflectionPolicy, WATERMARK_KEY};
