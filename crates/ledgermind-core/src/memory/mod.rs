//! Memory facade - the public API of the engine.
//!
//! Orchestrates sanitization, routing, the transactional semantic write
//! path, hybrid retrieval, proposal review, decay, reflection, and
//! maintenance across the underlying stores.

mod background;
mod events;
mod graph;
mod search;

pub use background::MaintenanceLoop;
pub use events::{EventBus, MemoryNotification};
pub use search::{SearchMode, SearchResult};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{MemoryError, Result};
use crate::reasoning::{
    ConflictEngine, DecayEngine, DecayReport, GitIndexer, LifecycleEngine, MergeEngine,
    ReflectionEngine, ReflectionPolicy, ResolutionEngine, LAST_INDEXED_KEY, MERGE_THRESHOLD,
    WATERMARK_KEY,
};
use crate::router::MemoryRouter;
use crate::schema::{
    sanitize::validate_fid, EventContext, EventKind, EventSource, MemoryConfig, MemoryDecision,
    MemoryEvent, ResolutionIntent, ResolutionType, StoreType, TrustBoundary,
};
use crate::search::{Document, VectorStore};
use crate::storage::{
    AuditCommit, EpisodicEvent, EpisodicStore, LockMode, SemanticStore,
};
use crate::targets::TargetRegistry;

#[cfg(feature = "embeddings")]
use crate::embeddings::LocalEmbedder;
use crate::embeddings::SharedEmbedder;

/// Vector similarity above which conflicts auto-resolve by superseding
const AUTO_SUPERSEDE_THRESHOLD: f32 = 0.70;

/// Lower edge of the arbitration gray zone
const ARBITER_LOW_THRESHOLD: f32 = 0.50;

/// Title similarity that lifts a candidate into the auto zone
const TITLE_MATCH_THRESHOLD: f64 = 0.90;

/// One side of an arbitration request
#[derive(Debug, Clone)]
pub struct ArbiterCandidate {
    /// Decision title
    pub title: String,
    /// Decision rationale (or cached content for existing records)
    pub rationale: String,
}

/// Callback consulted in the similarity gray zone; `"SUPERSEDE"` resolves
/// the conflict, anything else falls through to the hard conflict.
pub type Arbiter<'a> = &'a dyn Fn(&ArbiterCandidate, &ArbiterCandidate) -> String;

/// Structured readiness report from [`Memory::check_environment`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentReport {
    /// Whether the audit backend is initialized and healthy
    pub audit_available: bool,
    /// Whether the storage root accepts writes
    pub storage_writable: bool,
    /// Whether free disk space is adequate
    pub disk_space_ok: bool,
    /// Whether the audit repository passes its health check
    pub repo_healthy: bool,
    /// Whether vector search can encode queries
    pub vector_available: bool,
    /// Whether another process currently holds the store lock
    pub storage_locked: bool,
    /// PID recorded in the lock file, when locked
    pub lock_owner: Option<String>,
    /// Hard failures
    pub errors: Vec<String>,
    /// Soft degradations
    pub warnings: Vec<String>,
}

/// Summary returned by [`Memory::run_maintenance`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Decay results
    pub decay: DecayReport,
    /// Merge proposals created
    pub merge_proposal_ids: Vec<String>,
    /// `"ok"` or a violation description
    pub integrity: String,
}

/// Diagnostic statistics about the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Semantic records known to the index
    pub semantic_records: usize,
    /// Episodic events with active status
    pub active_events: i64,
    /// Default namespace of this handle
    pub namespace: String,
    /// Storage root
    pub storage_path: PathBuf,
}

// ============================================================================
// FACADE
// ============================================================================

/// The main entry point of the engine
pub struct Memory {
    config: MemoryConfig,
    storage_path: PathBuf,
    episodic: EpisodicStore,
    semantic: SemanticStore,
    vector: Mutex<VectorStore>,
    targets: Mutex<TargetRegistry>,
    conflicts: ConflictEngine,
    router: MemoryRouter,
    decay_engine: DecayEngine,
    lifecycle: LifecycleEngine,
    reflection_policy: ReflectionPolicy,
    bus: EventBus,
}

impl Memory {
    /// Open the engine with the default embedder for the build
    /// configuration.
    pub fn open(config: MemoryConfig) -> Result<Self> {
        #[cfg(feature = "embeddings")]
        let embedder: Option<SharedEmbedder> = Some(std::sync::Arc::new(LocalEmbedder::new()));
        #[cfg(not(feature = "embeddings"))]
        let embedder: Option<SharedEmbedder> = None;
        Self::open_with_embedder(config, embedder)
    }

    /// Open the engine with an explicit embedding provider (or none, which
    /// degrades vector search to keyword-only retrieval).
    pub fn open_with_embedder(
        config: MemoryConfig,
        embedder: Option<SharedEmbedder>,
    ) -> Result<Self> {
        let storage_path = match &config.storage_path {
            Some(p) => p.clone(),
            None => directories::ProjectDirs::from("io", "ledgermind", "core")
                .map(|d| d.data_dir().to_path_buf())
                .ok_or_else(|| {
                    MemoryError::Validation("could not determine a storage directory".into())
                })?,
        };
        std::fs::create_dir_all(&storage_path).map_err(|e| MemoryError::StorageUnavailable {
            path: storage_path.clone(),
            reason: e.to_string(),
        })?;

        let semantic = SemanticStore::open(
            storage_path.join("semantic"),
            config.trust_boundary,
            config.enable_audit,
        )?;
        let episodic = EpisodicStore::open(storage_path.join("episodic.db"))?;

        let mut vector = VectorStore::new(storage_path.join("vector_index"), embedder);
        vector.load();

        let targets = TargetRegistry::open(&storage_path);
        let conflicts = ConflictEngine::new(semantic.meta.clone());
        let router = MemoryRouter::new(
            ConflictEngine::new(semantic.meta.clone()),
            ResolutionEngine::new(),
            config.trust_boundary,
        );
        let decay_engine = DecayEngine::new(
            config.ttl_days,
            config.semantic_decay_rate,
            config.forget_threshold,
        );

        let memory = Self {
            storage_path,
            episodic,
            semantic,
            vector: Mutex::new(vector),
            targets: Mutex::new(targets),
            conflicts,
            router,
            decay_engine,
            lifecycle: LifecycleEngine::default(),
            reflection_policy: ReflectionPolicy::default(),
            bus: EventBus::new(),
            config,
        };
        memory.check_environment();
        Ok(memory)
    }

    /// Engine configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Default namespace of this handle
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Storage root
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// The episodic log
    pub fn episodic(&self) -> &EpisodicStore {
        &self.episodic
    }

    /// The semantic store
    pub fn semantic(&self) -> &SemanticStore {
        &self.semantic
    }

    /// The vector index
    pub fn vector(&self) -> &Mutex<VectorStore> {
        &self.vector
    }

    /// The notification bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Override the reflection policy
    pub fn set_reflection_policy(&mut self, policy: ReflectionPolicy) {
        self.reflection_policy = policy;
    }

    // ========================================================================
    // EVENT PROCESSING
    // ========================================================================

    /// Process an incoming event and decide whether to persist it.
    ///
    /// The returned decision's metadata carries `file_id` for semantic
    /// writes and `event_id` for episodic ones.
    pub fn process_event(
        &self,
        source: EventSource,
        kind: EventKind,
        content: &str,
        context: Option<EventContext>,
        intent: Option<&ResolutionIntent>,
        namespace: Option<&str>,
    ) -> Result<MemoryDecision> {
        let effective_namespace = namespace.unwrap_or(self.namespace()).to_string();

        if self.config.trust_boundary == TrustBoundary::HumanOnly
            && source == EventSource::Agent
            && kind == EventKind::Decision
        {
            return Ok(MemoryDecision::rejected("Trust Boundary Violation"));
        }

        let mut event = MemoryEvent::new(source, kind, content, context)?;

        // Duplicate suppression, deep check including context
        if self.episodic.find_duplicate(&event, None, true)?.is_some() {
            return Ok(MemoryDecision::rejected("Duplicate event detected"));
        }

        let mut decision = self.router.route(&event, intent, &effective_namespace)?;
        if !decision.should_persist {
            return Ok(decision);
        }

        // Optimistic conflict detection for semantic records without an
        // intent; the authoritative check happens again inside the lock
        if decision.store_type == StoreType::Semantic && intent.is_none() {
            if let Some(conflict) = self
                .conflicts
                .check_for_conflicts(&event, &effective_namespace)?
            {
                return Ok(MemoryDecision::rejected(format!(
                    "Invariant Violation: {conflict}"
                )));
            }
        }

        match decision.store_type {
            StoreType::Episodic => {
                let event_id = self.episodic.append(&event, None, 1.0)?;
                decision.metadata.insert("event_id".into(), json!(event_id));
                self.bus.emit(MemoryNotification::EpisodicAdded {
                    id: event_id,
                    kind: event.kind.as_str().to_string(),
                });
            }
            StoreType::Semantic => {
                let new_fid = self.semantic_write(&mut event, intent, &effective_namespace)?;
                decision.metadata.insert("file_id".into(), json!(new_fid.clone()));
                self.bus.emit(MemoryNotification::SemanticAdded {
                    id: new_fid.clone(),
                    kind: event.kind.as_str().to_string(),
                    namespace: effective_namespace,
                });

                // Index the content vector outside the filesystem
                // transaction; failures never abort a semantic write
                self.index_vector(&new_fid, &event);

                // Immortal link: the creating event itself
                let event_id = self.episodic.append(&event, Some(&new_fid), 1.0)?;
                decision.metadata.insert("event_id".into(), json!(event_id));
            }
            StoreType::None => {}
        }
        Ok(decision)
    }

    /// The transactional portion of a semantic write.
    fn semantic_write(
        &self,
        event: &mut MemoryEvent,
        intent: Option<&ResolutionIntent>,
        namespace: &str,
    ) -> Result<String> {
        let supersede_ids: Vec<String> = intent
            .filter(|i| i.resolution_type == ResolutionType::Supersede)
            .map(|i| i.target_decision_ids.clone())
            .unwrap_or_default();

        self.semantic.transaction(|| {
            // Flip predecessors first to satisfy the unique-active index
            for old_id in &supersede_ids {
                match self.semantic.meta.get_by_fid(old_id)? {
                    Some(meta) if meta.status == "active" => {
                        tracing::debug!(old_id, "deactivating superseded decision");
                        let mut updates = serde_json::Map::new();
                        updates.insert("status".into(), json!("superseded"));
                        self.semantic
                            .update_decision(old_id, &updates, "Deactivating for transition")?;
                    }
                    _ => {
                        tracing::info!(
                            old_id,
                            "target already superseded or missing during transition"
                        );
                    }
                }
            }

            // Late-bound conflict detection inside the lock closes the
            // window between two concurrent writers
            if let Some(conflict) = self.conflicts.check_for_conflicts(event, namespace)? {
                tracing::warn!("race condition prevented: {conflict}");
                return Err(MemoryError::Conflict(format!(
                    "Conflict detected during transaction: {conflict}"
                )));
            }

            if let Ok(delay) = std::env::var("LEDGERMIND_TEST_DELAY") {
                if let Ok(secs) = delay.parse::<f64>() {
                    std::thread::sleep(Duration::from_secs_f64(secs));
                }
            }

            // Manual interventions enter the lifecycle mid-stream:
            // system scope, high removal cost, straight to emergent
            if event.kind == EventKind::Intervention {
                if let EventContext::Stream(stream) = &mut event.context {
                    self.lifecycle
                        .process_intervention(stream, chrono::Utc::now());
                }
            }

            // Stamp resolution results and the namespace into the context
            match &mut event.context {
                EventContext::Decision(d) => {
                    if !supersede_ids.is_empty() {
                        d.supersedes = supersede_ids.clone();
                    }
                    d.namespace = namespace.to_string();
                }
                EventContext::Proposal(p) => {
                    p.namespace = namespace.to_string();
                }
                EventContext::Stream(s) => {
                    s.namespace = namespace.to_string();
                }
                EventContext::Map(map) => {
                    if let Some(obj) = map.as_object_mut() {
                        if !supersede_ids.is_empty() {
                            obj.insert("supersedes".into(), json!(supersede_ids.clone()));
                        }
                        obj.insert("namespace".into(), json!(namespace));
                    }
                }
            }

            let new_fid = self.semantic.save(event, Some(namespace))?;

            // Close the backlinks now that the successor id exists
            for old_id in &supersede_ids {
                let mut updates = serde_json::Map::new();
                updates.insert("status".into(), json!("superseded"));
                updates.insert("superseded_by".into(), json!(new_fid.clone()));
                self.semantic
                    .update_decision(old_id, &updates, &format!("Superseded by {new_fid}"))?;
            }

            // Grounding: link declared evidence plus everything inherited
            // from the superseded predecessors
            let mut grounding: BTreeSet<i64> = event
                .context
                .to_value()
                .get("evidence_event_ids")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            for old_id in &supersede_ids {
                match self.episodic.get_linked_event_ids(old_id) {
                    Ok(ids) => grounding.extend(ids),
                    Err(e) => {
                        tracing::warn!(old_id, "failed to fetch links from superseded item: {e}")
                    }
                }
            }
            for event_id in grounding {
                if let Err(e) = self.episodic.link_to_semantic(event_id, &new_fid, 1.0) {
                    tracing::warn!(event_id, "failed to link grounding evidence: {e}");
                }
            }

            Ok(new_fid)
        })
    }

    fn index_vector(&self, fid: &str, event: &MemoryEvent) {
        let rationale = event
            .context
            .get_str("rationale")
            .unwrap_or_default();
        let indexed_content = if rationale.is_empty() {
            event.content.clone()
        } else {
            format!("{}\n{}", event.content, rationale)
        };
        let mut vector = self.vector.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = vector.add_documents(
            &[Document {
                id: fid.to_string(),
                content: indexed_content,
            }],
            None,
        ) {
            tracing::warn!(fid, "vector indexing failed: {e}");
        }
    }

    // ========================================================================
    // DECISIONS
    // ========================================================================

    /// Record a new decision, auto-resolving conflicts by similarity with
    /// optional arbitration in the gray zone.
    #[allow(clippy::too_many_arguments)]
    pub fn record_decision(
        &self,
        title: &str,
        target: &str,
        rationale: &str,
        consequences: Option<Vec<String>>,
        evidence_ids: Option<Vec<i64>>,
        namespace: Option<&str>,
        arbiter: Option<Arbiter<'_>>,
    ) -> Result<MemoryDecision> {
        if title.trim().is_empty() {
            return Err(MemoryError::Validation("Title cannot be empty".into()));
        }
        if target.trim().is_empty() {
            return Err(MemoryError::Validation("Target cannot be empty".into()));
        }
        if rationale.trim().is_empty() {
            return Err(MemoryError::Validation("Rationale cannot be empty".into()));
        }

        let effective_namespace = namespace.unwrap_or(self.namespace()).to_string();

        let target = {
            let mut registry = self.targets.lock().unwrap_or_else(|p| p.into_inner());
            let normalized = registry.normalize(target);
            registry.register(&normalized, title, &[])?;
            normalized
        };

        let active_conflicts = self
            .semantic
            .list_active_conflicts(&target, &effective_namespace)?;
        if !active_conflicts.is_empty() {
            match self.try_auto_resolve(
                title,
                &target,
                rationale,
                &active_conflicts,
                consequences.clone(),
                evidence_ids.clone(),
                &effective_namespace,
                arbiter,
            ) {
                Ok(Some(decision)) => return Ok(decision),
                Ok(None) => {}
                Err(e) => tracing::warn!("auto-resolution failed: {e}"),
            }

            let suggestions = self
                .targets
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .suggest(&target, 3);
            let mut msg = format!(
                "CONFLICT: Target '{target}' in namespace '{effective_namespace}' already has active decisions: {active_conflicts:?}. "
            );
            if !suggestions.is_empty() {
                msg.push_str(&format!("Did you mean: {}?", suggestions.join(", ")));
            }
            return Err(MemoryError::Conflict(msg));
        }

        let ctx = json!({
            "title": title,
            "target": target,
            "status": "active",
            "rationale": rationale,
            "consequences": consequences.unwrap_or_default(),
            "evidence_event_ids": evidence_ids.unwrap_or_default(),
            "namespace": effective_namespace,
        });
        let decision = self.process_event(
            EventSource::Agent,
            EventKind::Decision,
            title,
            Some(EventContext::Map(ctx)),
            None,
            Some(&effective_namespace),
        )?;

        if !decision.should_persist {
            if decision.reason.contains("CONFLICT") {
                return Err(MemoryError::Conflict(decision.reason));
            }
            return Err(MemoryError::Invariant(format!(
                "Failed to record decision: {}",
                decision.reason
            )));
        }
        Ok(decision)
    }

    /// Similarity-based automatic conflict resolution.
    ///
    /// Returns `Ok(Some(decision))` when a competitor was auto-superseded,
    /// `Ok(None)` when the caller should fall through to a hard conflict.
    #[allow(clippy::too_many_arguments)]
    fn try_auto_resolve(
        &self,
        title: &str,
        target: &str,
        rationale: &str,
        active_conflicts: &[String],
        consequences: Option<Vec<String>>,
        evidence_ids: Option<Vec<i64>>,
        namespace: &str,
        arbiter: Option<Arbiter<'_>>,
    ) -> Result<Option<MemoryDecision>> {
        let new_vec = {
            let mut vector = self.vector.lock().unwrap_or_else(|p| p.into_inner());
            if !vector.embedder_available() {
                return Ok(None);
            }
            match vector.encode_query(&format!("{title}\n{rationale}")) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("similarity encoding failed: {e}");
                    return Ok(None);
                }
            }
        };

        for old_fid in active_conflicts {
            let Some(old_meta) = self.semantic.meta.get_by_fid(old_fid)? else {
                continue;
            };
            let old_vec = {
                let vector = self.vector.lock().unwrap_or_else(|p| p.into_inner());
                vector.get_vector(old_fid).map(|v| v.to_vec())
            };
            let Some(old_vec) = old_vec else {
                continue;
            };

            // Vectors are stored normalized, so similarity is a dot product
            let mut sim: f32 = new_vec
                .iter()
                .zip(old_vec.iter())
                .map(|(a, b)| a * b)
                .sum();

            // Near-identical titles force the candidate into consideration
            let title_sim =
                strsim::normalized_levenshtein(&title.to_lowercase(), &old_meta.title.to_lowercase());
            if title_sim > TITLE_MATCH_THRESHOLD {
                sim = sim.max(0.71);
                tracing::info!(
                    target_key = target,
                    title_sim,
                    adjusted = sim,
                    "title match boost"
                );
            }
            tracing::info!(
                target_key = target,
                old_fid,
                similarity = sim,
                "similarity check against active competitor"
            );

            // Gray zone: defer to the arbiter; anything but SUPERSEDE
            // leaves the similarity untouched
            if (ARBITER_LOW_THRESHOLD..AUTO_SUPERSEDE_THRESHOLD).contains(&sim) {
                if let Some(arbiter) = arbiter {
                    tracing::info!(similarity = sim, "gray zone; consulting arbiter");
                    let new_side = ArbiterCandidate {
                        title: title.to_string(),
                        rationale: rationale.to_string(),
                    };
                    let old_side = ArbiterCandidate {
                        title: old_meta.title.clone(),
                        rationale: old_meta.content.clone(),
                    };
                    if arbiter(&new_side, &old_side) == "SUPERSEDE" {
                        sim = 0.71;
                        tracing::info!("arbiter decided: SUPERSEDE");
                    }
                }
            }

            if sim > AUTO_SUPERSEDE_THRESHOLD {
                tracing::info!(
                    target_key = target,
                    similarity = sim,
                    old_fid,
                    "auto-resolving conflict by superseding"
                );
                let decision = self.supersede_decision(
                    title,
                    target,
                    &format!(
                        "Auto-Evolution: Updated based on high similarity ({sim:.2}). {rationale}"
                    ),
                    &[old_fid.clone()],
                    consequences,
                    evidence_ids,
                    Some(namespace),
                )?;
                return Ok(Some(decision));
            }
        }
        Ok(None)
    }

    /// Evolve knowledge by superseding existing active decisions.
    pub fn supersede_decision(
        &self,
        title: &str,
        target: &str,
        rationale: &str,
        old_decision_ids: &[String],
        consequences: Option<Vec<String>>,
        evidence_ids: Option<Vec<i64>>,
        namespace: Option<&str>,
    ) -> Result<MemoryDecision> {
        let effective_namespace = namespace.unwrap_or(self.namespace()).to_string();

        let active = self
            .semantic
            .list_active_conflicts(target, &effective_namespace)?;
        for old_id in old_decision_ids {
            if !active.contains(old_id) {
                return Err(MemoryError::Conflict(format!(
                    "Cannot supersede {old_id}: it is no longer active for target {target} in namespace {effective_namespace}"
                )));
            }
        }

        let intent = ResolutionIntent::new(
            ResolutionType::Supersede,
            rationale,
            old_decision_ids.to_vec(),
        )?;
        let ctx = json!({
            "title": title,
            "target": target,
            "status": "active",
            "rationale": rationale,
            "consequences": consequences.unwrap_or_default(),
            "evidence_event_ids": evidence_ids.unwrap_or_default(),
            "namespace": effective_namespace,
        });
        let decision = self.process_event(
            EventSource::Agent,
            EventKind::Decision,
            title,
            Some(EventContext::Map(ctx)),
            Some(&intent),
            Some(&effective_namespace),
        )?;

        if !decision.should_persist {
            if decision.reason.contains("CONFLICT") {
                return Err(MemoryError::Conflict(decision.reason));
            }
            return Err(MemoryError::Invariant(format!(
                "Failed to supersede decision: {}",
                decision.reason
            )));
        }
        Ok(decision)
    }

    // ========================================================================
    // PROPOSALS
    // ========================================================================

    /// Convert a draft proposal into an active decision.
    ///
    /// Runs inside one transaction: if the inner record fails, the
    /// rollback leaves the proposal a draft.
    pub fn accept_proposal(&self, proposal_id: &str) -> Result<MemoryDecision> {
        validate_fid(proposal_id)?;
        let (doc, _body) = self.semantic.load_artifact(proposal_id)?;

        if doc.kind != "proposal" {
            return Err(MemoryError::Validation(format!(
                "File {proposal_id} is not a proposal"
            )));
        }
        let status = doc.context_str("status").unwrap_or("unknown");
        if status != "draft" {
            return Err(MemoryError::Validation(format!(
                "Proposal {proposal_id} is already {status}"
            )));
        }

        self.semantic.transaction(|| {
            let supersedes = doc.context_list("suggested_supersedes");

            // Grounding inheritance: declared evidence plus the links the
            // proposal accumulated (which include its own creation event)
            let mut grounding: BTreeSet<i64> = doc
                .context
                .get("evidence_event_ids")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
                .unwrap_or_default();
            if let Ok(links) = self.episodic.get_linked_event_ids(proposal_id) {
                grounding.extend(links);
            }
            let evidence_ids: Vec<i64> = grounding.into_iter().collect();

            let title = doc.context_str("title").unwrap_or("Untitled proposal");
            let target = doc.context_str("target").unwrap_or("unknown");
            let rationale = format!(
                "Accepted proposal {proposal_id}. {}",
                doc.context_str("rationale").unwrap_or_default()
            );
            let consequences = Some(doc.context_list("suggested_consequences"));

            let decision = if supersedes.is_empty() {
                self.record_decision(
                    title,
                    target,
                    &rationale,
                    consequences,
                    Some(evidence_ids),
                    None,
                    None,
                )?
            } else {
                self.supersede_decision(
                    title,
                    target,
                    &rationale,
                    &supersedes,
                    consequences,
                    Some(evidence_ids),
                    None,
                )?
            };

            if decision.should_persist {
                let new_id = decision.file_id().unwrap_or_default().to_string();
                let mut updates = serde_json::Map::new();
                updates.insert("status".into(), json!("accepted"));
                updates.insert("converted_to".into(), json!(new_id.clone()));
                self.semantic.update_decision(
                    proposal_id,
                    &updates,
                    &format!("Accepted and converted to {new_id}"),
                )?;
            }
            Ok(decision)
        })
    }

    /// Mark a proposal rejected with a reason.
    pub fn reject_proposal(&self, proposal_id: &str, reason: &str) -> Result<()> {
        validate_fid(proposal_id)?;
        let mut updates = serde_json::Map::new();
        updates.insert("status".into(), json!("rejected"));
        updates.insert("rejection_reason".into(), json!(reason));
        self.semantic.update_decision(
            proposal_id,
            &updates,
            &format!("Rejected proposal: {reason}"),
        )
    }

    // ========================================================================
    // UPDATES AND DELETION
    // ========================================================================

    /// Coordinate an update to a semantic record across all stores.
    ///
    /// A no-op update (every key already holds the requested value) skips
    /// the write entirely: no new audit commit, no metadata change.
    pub fn update_decision(
        &self,
        decision_id: &str,
        updates: &serde_json::Map<String, Value>,
        commit_msg: &str,
    ) -> Result<bool> {
        validate_fid(decision_id)?;

        if let Some(current) = self.semantic.meta.get_by_fid(decision_id)? {
            let ctx = current.context();
            let changed = updates.iter().any(|(key, value)| {
                let current_value = match key.as_str() {
                    "status" => Some(json!(current.status)),
                    "confidence" => Some(json!(current.confidence)),
                    "superseded_by" => current.superseded_by.as_ref().map(|s| json!(s)),
                    _ => None,
                }
                .or_else(|| ctx.get(key).cloned());
                current_value.as_ref() != Some(value)
            });
            if !changed {
                tracing::debug!(decision_id, "update skipped: no changes detected");
                return Ok(true);
            }
        }

        self.semantic.transaction(|| {
            self.semantic.update_decision(decision_id, updates, commit_msg)?;

            // Re-index the vector when the searchable text changed
            if updates.contains_key("content") || updates.contains_key("rationale") {
                if let Some(meta) = self.semantic.meta.get_by_fid(decision_id)? {
                    let mut vector = self.vector.lock().unwrap_or_else(|p| p.into_inner());
                    if let Err(e) = vector.add_documents(
                        &[Document {
                            id: decision_id.to_string(),
                            content: meta.content,
                        }],
                        None,
                    ) {
                        tracing::warn!(decision_id, "vector re-indexing failed: {e}");
                    }
                }
            }

            // Log the update episodically (proposal churn stays quiet)
            if let Some(meta) = self.semantic.meta.get_by_fid(decision_id)? {
                if meta.kind != "proposal" {
                    let event = MemoryEvent::new(
                        EventSource::System,
                        EventKind::CommitChange,
                        &format!("Updated {}: {}", meta.kind, meta.title),
                        Some(EventContext::Map(json!({
                            "original_kind": meta.kind,
                            "updates": updates,
                            "target": meta.target,
                            "rationale": commit_msg,
                        }))),
                    )?;
                    if self
                        .episodic
                        .find_duplicate(&event, Some(decision_id), false)?
                        .is_none()
                    {
                        self.episodic.append(&event, Some(decision_id), 1.0)?;
                    }
                }
            }
            Ok(true)
        })
    }

    /// Hard-delete a memory from every store.
    pub fn forget(&self, decision_id: &str) -> Result<()> {
        validate_fid(decision_id)?;
        self.episodic.unlink_all_for_semantic(decision_id)?;
        self.semantic.purge_memory(decision_id)?;
        self.vector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove_id(decision_id);
        tracing::info!(decision_id, "memory forgotten across systems");
        Ok(())
    }

    // ========================================================================
    // LISTING AND HISTORY
    // ========================================================================

    /// All artifact ids in the semantic store
    pub fn get_decisions(&self) -> Result<Vec<String>> {
        self.semantic.list_decisions()
    }

    /// Active decision ids for a target in this handle's namespace
    pub fn list_active_conflicts(&self, target: &str) -> Result<Vec<String>> {
        self.semantic.list_active_conflicts(target, self.namespace())
    }

    /// Full version history of one artifact from the audit log
    pub fn get_decision_history(&self, decision_id: &str) -> Result<Vec<AuditCommit>> {
        self.semantic.get_history(decision_id)
    }

    /// Recent episodic events, newest first
    pub fn get_recent_events(
        &self,
        limit: usize,
        include_archived: bool,
    ) -> Result<Vec<EpisodicEvent>> {
        let status = if include_archived { None } else { Some("active") };
        self.episodic.query(limit, status, None, false)
    }

    /// Manually link an episodic event to a semantic record
    pub fn link_evidence(&self, event_id: i64, semantic_id: &str) -> Result<()> {
        self.episodic.link_to_semantic(event_id, semantic_id, 1.0)
    }

    /// Diagnostic statistics
    pub fn get_stats(&self) -> Result<MemoryStats> {
        Ok(MemoryStats {
            semantic_records: self.get_decisions()?.len(),
            active_events: self.episodic.count_events(Some("active"))?,
            namespace: self.namespace().to_string(),
            storage_path: self.storage_path.clone(),
        })
    }

    // ========================================================================
    // DECAY, REFLECTION, MAINTENANCE
    // ========================================================================

    /// Run the decay pass over both stores.
    pub fn run_decay(&self, dry_run: bool) -> Result<DecayReport> {
        let now = chrono::Utc::now();
        let all_events = self.episodic.query(20_000, None, None, false)?;
        let (to_archive, to_prune, retained) = self.decay_engine.evaluate(&all_events, now);

        let all_rows = self.semantic.meta.list_all()?;
        let semantic_results = self.decay_engine.evaluate_semantic(&all_rows, now);

        let mut report = DecayReport {
            archived: to_archive.len(),
            pruned: to_prune.len(),
            retained_by_link: retained,
            ..Default::default()
        };
        if dry_run {
            report.semantic_decayed = semantic_results.len();
            return Ok(report);
        }

        self.semantic.transaction(|| {
            self.episodic.mark_archived(&to_archive)?;
            self.episodic.physical_prune(&to_prune)?;

            for decay in &semantic_results {
                if decay.should_forget {
                    tracing::info!(
                        fid = %decay.fid,
                        confidence = decay.new_confidence,
                        "semantic decay: forgetting"
                    );
                    self.forget(&decay.fid)?;
                    report.semantic_forgotten += 1;
                    continue;
                }

                let mut updates = serde_json::Map::new();
                updates.insert("confidence".into(), json!(decay.new_confidence));

                // Stale decisions and constraints drop to deprecated once
                // confidence falls below the configured threshold
                if let Some(meta) = self.semantic.meta.get_by_fid(&decay.fid)? {
                    if matches!(meta.kind.as_str(), "decision" | "constraint")
                        && meta.status == "active"
                        && decay.new_confidence < self.config.deprecate_threshold
                    {
                        tracing::info!(
                            fid = %decay.fid,
                            confidence = decay.new_confidence,
                            "semantic decay: deprecating"
                        );
                        updates.insert("status".into(), json!("deprecated"));
                        report.semantic_deprecated += 1;
                    }
                }

                self.semantic.update_decision(
                    &decay.fid,
                    &updates,
                    &format!("Decay: Reduced confidence to {}", decay.new_confidence),
                )?;
                report.semantic_decayed += 1;
            }
            Ok(())
        })?;

        Ok(report)
    }

    /// Run one incremental reflection cycle, advancing the watermark only
    /// when new events were processed.
    pub fn run_reflection(&self) -> Result<Vec<String>> {
        let after_id = self
            .semantic
            .meta
            .get_config(WATERMARK_KEY)?
            .and_then(|v| v.parse::<i64>().ok());

        let engine = ReflectionEngine::new(self, self.reflection_policy.clone());
        let (proposal_ids, new_max_id) = engine.run_cycle(after_id)?;

        if let Some(new_max) = new_max_id {
            if after_id.is_none_or(|prev| new_max > prev) {
                let _guard = self
                    .semantic
                    .lock()
                    .acquire(LockMode::Exclusive, Some(Duration::from_secs(5)))?;
                self.semantic
                    .meta
                    .set_config(WATERMARK_KEY, &new_max.to_string())?;
                tracing::info!(watermark = new_max, "reflection: updated watermark");
            }
        }
        Ok(proposal_ids)
    }

    /// Periodic maintenance: meta resync, forced integrity scan, decay,
    /// and duplicate-merge analysis.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.semantic.sync_meta_index(false)?;
        let integrity = match self
            .semantic
            .integrity()
            .validate(self.semantic.repo_path(), true)
        {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                tracing::error!("integrity violation detected during maintenance: {e}");
                format!("violation: {e}")
            }
        };

        let decay = self.run_decay(false)?;
        let merger = MergeEngine::new(self);
        let merge_proposal_ids = merger.scan_for_duplicates(MERGE_THRESHOLD)?;

        Ok(MaintenanceReport {
            decay,
            merge_proposal_ids,
            integrity,
        })
    }

    /// Sync recent project commits into episodic memory. Returns how many
    /// commits were newly indexed.
    pub fn sync_git(&self, repo_path: &str, limit: usize) -> Result<usize> {
        let indexer = GitIndexer::new(repo_path)?;

        let mut last_hash = self.semantic.meta.get_config(LAST_INDEXED_KEY)?;
        if last_hash.is_none() {
            // Fall back to the most recent indexed commit event
            for ev in self.episodic.query(50, None, None, false)? {
                if ev.kind == "commit_change" {
                    if let Some(hash) = ev.context_str("hash") {
                        last_hash = Some(hash.to_string());
                        break;
                    }
                }
            }
        }

        let commits = indexer.get_recent_commits(limit, last_hash.as_deref())?;
        if commits.is_empty() {
            return Ok(0);
        }

        let mut indexed = 0usize;
        let mut latest_hash = last_hash;
        for commit in &commits {
            let event = GitIndexer::commit_event(commit)?;
            if self.episodic.find_duplicate(&event, None, false)?.is_none() {
                self.episodic.append(&event, None, 1.0)?;
                indexed += 1;
            }
            latest_hash = Some(commit.hash.clone());
        }
        if let Some(hash) = latest_hash {
            self.semantic.meta.set_config(LAST_INDEXED_KEY, &hash)?;
        }
        Ok(indexed)
    }

    // ========================================================================
    // ENVIRONMENT
    // ========================================================================

    /// Pre-flight check of storage, audit, and vector availability.
    ///
    /// The engine degrades rather than refusing to start: failures are
    /// reported, and only an unwritable storage root is fatal elsewhere.
    pub fn check_environment(&self) -> EnvironmentReport {
        let mut report = EnvironmentReport::default();

        // Lock status
        let lock_path = self.semantic.repo_path().join(".lock");
        if lock_path.exists() {
            if let Ok(owner) = std::fs::read_to_string(&lock_path) {
                let owner = owner.trim().to_string();
                if !owner.is_empty() {
                    report.storage_locked = true;
                    report
                        .warnings
                        .push(format!("Storage is currently locked by PID: {owner}"));
                    report.lock_owner = Some(owner);
                }
            }
        }

        // Vector search availability
        report.vector_available = self
            .vector
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .embedder_available();
        if !report.vector_available {
            report
                .warnings
                .push("No embedding provider configured. Vector search is disabled.".to_string());
        }

        // Audit backend
        report.audit_available = self.config.enable_audit;
        report.repo_healthy = self.semantic.audit_healthy();
        if self.config.enable_audit && !report.repo_healthy {
            report
                .errors
                .push("Audit repository initialization failed.".to_string());
        }

        // Storage permissions: probe with an actual write
        let probe = self.storage_path.join(".write_probe");
        match std::fs::write(&probe, b"probe") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                report.storage_writable = true;
                report.disk_space_ok = true;
            }
            Err(e) => {
                report.errors.push(format!(
                    "Storage path is not writable: {} ({e})",
                    self.storage_path.display()
                ));
            }
        }

        for error in &report.errors {
            tracing::error!("environment check failed: {error}");
        }
        report
    }

    /// Flush caches and release resources.
    pub fn close(&self) -> Result<()> {
        let mut vector = self.vector.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = vector.save() {
            tracing::warn!("vector flush on close failed: {e}");
        }
        tracing::info!("memory system closed");
        Ok(())
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
