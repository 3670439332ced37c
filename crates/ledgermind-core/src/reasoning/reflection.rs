//! Reflection engine - incremental proactive knowledge discovery.
//!
//! Reads forward from the `last_reflection_event_id` watermark, clusters
//! evidence by validated target, updates or falsifies existing draft
//! hypotheses, emits new competing hypotheses for error clusters and
//! best-practice / evolving-pattern proposals for success and commit
//! clusters, decays untouched drafts, and auto-accepts proposals whose
//! confidence clears the bar with no standing objections.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::error::Result;
use crate::memory::Memory;
use crate::reasoning::distillation::DistillationEngine;
use crate::schema::{EventContext, EventKind, EventSource, ProposalContext};
use crate::storage::frontmatter::parse_timestamp;
use crate::storage::EpisodicEvent;

/// Config key holding the reflection watermark
pub const WATERMARK_KEY: &str = "last_reflection_event_id";

/// Targets too generic to reason about
const BLACKLISTED_TARGETS: [&str; 6] = [
    "general",
    "general_development",
    "general_task",
    "unknown",
    "none",
    "null",
];

fn commit_scope_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\):").expect("static regex"))
}

fn target_is_valid(target: &str) -> bool {
    target.len() >= 3
        && !BLACKLISTED_TARGETS.contains(&target)
        && !target.to_lowercase().starts_with("general")
}

// ============================================================================
// POLICY
// ============================================================================

/// Thresholds governing hypothesis creation and acceptance
#[derive(Debug, Clone)]
pub struct ReflectionPolicy {
    /// Errors in a cluster before competing hypotheses are generated
    pub error_threshold: f64,
    /// Successes in a cluster before a best-practice proposal is generated
    pub success_threshold: f64,
    /// Drafts decaying below this are rejected
    pub min_confidence: f64,
    /// Minimum observation span before a draft is ready for review
    pub observation_window: Duration,
    /// Confidence lost per cycle by untouched drafts
    pub decay_rate: f64,
    /// Confidence at which a draft becomes ready for review
    pub ready_threshold: f64,
    /// Confidence at which a ready, unobjected draft auto-accepts
    pub auto_accept_threshold: f64,
}

impl Default for ReflectionPolicy {
    fn default() -> Self {
        Self {
            error_threshold: 2.0,
            success_threshold: 2.0,
            min_confidence: 0.3,
            observation_window: Duration::hours(1),
            decay_rate: 0.05,
            ready_threshold: 0.6,
            auto_accept_threshold: 0.9,
        }
    }
}

// ============================================================================
// EVIDENCE CLUSTERS
// ============================================================================

/// Aggregated evidence for one target
#[derive(Debug, Default, Clone)]
struct EvidenceCluster {
    errors: f64,
    successes: f64,
    commits: usize,
    success_event_ids: Vec<i64>,
    commit_events: Vec<EpisodicEvent>,
    all_ids: Vec<i64>,
    last_seen: Option<DateTime<Utc>>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Incremental reflection over the episodic log
pub struct ReflectionEngine<'a> {
    memory: &'a Memory,
    policy: ReflectionPolicy,
}

impl<'a> ReflectionEngine<'a> {
    /// Build an engine over the facade with the given policy
    pub fn new(memory: &'a Memory, policy: ReflectionPolicy) -> Self {
        Self { memory, policy }
    }

    /// Run one incremental cycle.
    ///
    /// Returns (created or updated proposal ids, highest processed event
    /// id). The caller advances the watermark only when events were
    /// actually processed.
    pub fn run_cycle(&self, after_id: Option<i64>) -> Result<(Vec<String>, Option<i64>)> {
        tracing::info!(?after_id, "starting incremental reflection cycle");
        let mut result_ids = Vec::new();
        let mut max_id = after_id;

        self.memory.semantic().transaction(|| {
            // 0. Procedural distillation
            let distiller = DistillationEngine::new(self.memory.episodic());
            for proposal in distiller.distill_trajectories(100, after_id)? {
                if !target_is_valid(&proposal.target) {
                    continue;
                }
                let title = proposal.title.clone();
                let decision = self.memory.process_event(
                    EventSource::ReflectionEngine,
                    EventKind::Proposal,
                    &title,
                    Some(EventContext::Proposal(Box::new(proposal))),
                    None,
                    None,
                )?;
                if let Some(fid) = decision.file_id() {
                    result_ids.push(fid.to_string());
                }
            }

            // 1. Evidence aggregation forward from the watermark
            let recent = self
                .memory
                .episodic()
                .query(1000, Some("active"), after_id, true)?;
            if recent.is_empty() {
                return Ok(());
            }
            max_id = recent.iter().map(|e| e.id).max().or(after_id);

            let clusters = Self::cluster_evidence(&recent);
            let all_drafts = self.draft_proposals()?;
            let active_targets = self.memory.semantic().meta.list_active_targets()?;
            let mut processed: HashSet<String> = HashSet::new();

            // 2. Update existing hypotheses or discover new ones
            for (target, stats) in &clusters {
                let relevant: Vec<(&String, &Value)> = all_drafts
                    .iter()
                    .filter(|(_, ctx)| {
                        ctx.get("target").and_then(|t| t.as_str()) == Some(target.as_str())
                    })
                    .map(|(fid, ctx)| (fid, ctx))
                    .collect();

                for (fid, ctx) in &relevant {
                    self.evaluate_hypothesis(fid, ctx, stats)?;
                    processed.insert((*fid).clone());
                    result_ids.push((*fid).clone());
                }

                if stats.errors >= self.policy.error_threshold {
                    let strong_exists = relevant.iter().any(|(_, ctx)| {
                        ctx.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.0) > 0.6
                    });
                    if !strong_exists {
                        result_ids.extend(self.generate_competing_hypotheses(target, stats)?);
                    }
                } else if stats.successes >= self.policy.success_threshold
                    && !active_targets.contains(target)
                    && relevant.is_empty()
                {
                    if let Some(fid) = self.generate_success_proposal(target, stats)? {
                        result_ids.push(fid);
                    }
                } else if stats.commits >= 2
                    && !active_targets.contains(target)
                    && relevant.is_empty()
                {
                    if let Some(fid) = self.generate_evolution_proposal(target, stats)? {
                        result_ids.push(fid);
                    }
                }
            }

            // 3. Decay untouched drafts, then check readiness everywhere
            let now = Utc::now();
            for (fid, ctx) in &all_drafts {
                if !processed.contains(fid) {
                    self.apply_decay(fid, ctx)?;
                }
                self.check_proposal_lifecycle(fid, ctx, now)?;
            }
            Ok(())
        })?;

        Ok((result_ids, max_id))
    }

    // ========================================================================
    // CLUSTERING
    // ========================================================================

    fn cluster_evidence(events: &[EpisodicEvent]) -> HashMap<String, EvidenceCluster> {
        let mut clusters: HashMap<String, EvidenceCluster> = HashMap::new();
        let mut last_valid_target: Option<String> = None;

        for ev in events {
            let mut target = ev.context_str("target").map(String::from);

            // Commits without a usable target get their scope from the
            // conventional-commit prefix: "fix(router): ..." -> router
            if ev.kind == "commit_change"
                && target.as_deref().map(|t| !target_is_valid(t)).unwrap_or(true)
            {
                target = commit_scope_re()
                    .captures(&ev.content)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .or(target);
            }

            // Prompts, results, and decisions inherit the last good target
            if target.is_none() && matches!(ev.kind.as_str(), "prompt" | "result" | "decision") {
                target = last_valid_target.clone();
            }

            let target = target.unwrap_or_else(|| "general".to_string());
            if target_is_valid(&target) {
                last_valid_target = Some(target.clone());
            } else {
                continue;
            }

            let cluster = clusters.entry(target).or_default();
            cluster.all_ids.push(ev.id);

            match ev.kind.as_str() {
                "error" => {
                    cluster.errors += 1.0;
                }
                "result" => {
                    // Success is continuous in [0, 1]
                    let score = match ev.context.get("success") {
                        Some(Value::Bool(true)) => 1.0,
                        Some(Value::Bool(false)) => 0.0,
                        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.5).clamp(0.0, 1.0),
                        _ => 0.5,
                    };
                    cluster.successes += score;
                    cluster.errors += 1.0 - score;
                    if score >= 0.5 {
                        cluster.success_event_ids.push(ev.id);
                    }
                }
                "commit_change" => {
                    cluster.commits += 1;
                    cluster.commit_events.push(ev.clone());
                }
                _ => {}
            }

            if let Some(ts) = parse_timestamp(&ev.timestamp) {
                cluster.last_seen = Some(cluster.last_seen.map_or(ts, |prev| prev.max(ts)));
            }
        }
        clusters
    }

    // ========================================================================
    // HYPOTHESIS EVALUATION
    // ========================================================================

    fn evaluate_hypothesis(&self, fid: &str, ctx: &Value, stats: &EvidenceCluster) -> Result<()> {
        let new_errors = ctx.get("hit_count").and_then(|v| v.as_f64()).unwrap_or(0.0) + stats.errors;
        let new_successes =
            ctx.get("miss_count").and_then(|v| v.as_f64()).unwrap_or(0.0) + stats.successes;

        let mut objections: HashSet<String> = ctx
            .get("objections")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|o| o.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if stats.successes > 0.0 {
            objections.insert(format!(
                "Falsification Signal: {} successes observed in target area.",
                stats.successes
            ));
        }

        let total = new_errors + new_successes;
        if total == 0.0 {
            return Ok(());
        }

        let base_rate = new_errors / total;
        let epistemic_penalty = (new_successes * 2.0) / (new_errors + 1.0);
        let confidence = (base_rate - epistemic_penalty).clamp(0.0, 1.0);

        if confidence <= 0.05 && new_successes > new_errors {
            let mut final_objections: Vec<String> = objections.into_iter().collect();
            final_objections.sort();
            final_objections
                .push("Hypothesis failed to explain high success rate.".to_string());
            let mut updates = serde_json::Map::new();
            updates.insert("status".into(), json!("falsified"));
            updates.insert("confidence".into(), json!(0.0));
            updates.insert("objections".into(), json!(final_objections));
            self.memory
                .update_decision(fid, &updates, "Reflection: Hypothesis falsified.")?;
            return Ok(());
        }

        let first_seen = ctx
            .get("first_observed_at")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let last_seen = stats.last_seen.unwrap_or_else(Utc::now);

        let ready = confidence >= self.policy.ready_threshold
            && (last_seen - first_seen) >= self.policy.observation_window
            && objections.len() < 2;

        // Generative rationale synthesized from the numbers
        let success_rate = (new_successes / total) * 100.0;
        let stability = if confidence > 0.7 {
            "stable"
        } else if confidence > 0.3 {
            "emerging"
        } else {
            "volatile"
        };
        let mut evidence_ids: HashSet<i64> = ctx
            .get("evidence_event_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        evidence_ids.extend(&stats.all_ids);
        let mut evidence_ids: Vec<i64> = evidence_ids.into_iter().collect();
        evidence_ids.sort_unstable();

        let target = ctx
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let rationale = format!(
            "Pattern recognized in {target}. Success rate: {success_rate:.1}% over {total:.0} observations. \
             Current state is {stability} with confidence {confidence:.2}. \
             Evidence backed by {} episodic events.",
            evidence_ids.len()
        );

        let mut counter_ids: HashSet<i64> = ctx
            .get("counter_evidence_event_ids")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        counter_ids.extend(&stats.success_event_ids);
        let mut counter_ids: Vec<i64> = counter_ids.into_iter().collect();
        counter_ids.sort_unstable();

        let mut sorted_objections: Vec<String> = objections.into_iter().collect();
        sorted_objections.sort();

        let mut updates = serde_json::Map::new();
        updates.insert("confidence".into(), json!((confidence * 100.0).round() / 100.0));
        updates.insert("hit_count".into(), json!(new_errors));
        updates.insert("miss_count".into(), json!(new_successes));
        updates.insert("objections".into(), json!(sorted_objections));
        updates.insert("ready_for_review".into(), json!(ready));
        updates.insert("rationale".into(), json!(rationale));
        updates.insert("evidence_event_ids".into(), json!(evidence_ids));
        updates.insert("counter_evidence_event_ids".into(), json!(counter_ids));

        self.memory.update_decision(
            fid,
            &updates,
            &format!("Reflection: Epistemic update. Confidence: {confidence:.2}"),
        )?;
        Ok(())
    }

    // ========================================================================
    // PROPOSAL GENERATION
    // ========================================================================

    fn distill_for_cluster(&self, stats: &EvidenceCluster) -> Option<crate::schema::ProceduralContent> {
        let min_id = stats.all_ids.iter().min().copied()?;
        let events = self
            .memory
            .episodic()
            .query(100, None, Some(min_id - 1), true)
            .ok()?;
        let target_events: Vec<EpisodicEvent> = events
            .into_iter()
            .filter(|e| stats.all_ids.contains(&e.id))
            .collect();
        let (trajectory, result) = target_events.split_at(target_events.len().checked_sub(1)?);
        let result = result.first()?;
        let distiller = DistillationEngine::new(self.memory.episodic());
        distiller
            .create_procedural_proposal(trajectory, result)
            .procedural
    }

    fn emit_proposal(&self, proposal: ProposalContext) -> Result<Option<String>> {
        let title = proposal.title.clone();
        let decision = self.memory.process_event(
            EventSource::ReflectionEngine,
            EventKind::Proposal,
            &title,
            Some(EventContext::Proposal(Box::new(proposal))),
            None,
            None,
        )?;
        Ok(decision.file_id().map(String::from))
    }

    /// Two competing explanations for an error cluster
    fn generate_competing_hypotheses(
        &self,
        target: &str,
        stats: &EvidenceCluster,
    ) -> Result<Vec<String>> {
        let procedural = self.distill_for_cluster(stats);

        let mut structural = ProposalContext::new(
            format!("Structural flaw in {target}"),
            target,
            "Consistent failures suggest a missing logical constraint.",
            0.5,
        );
        structural.strengths = vec!["Explains repeated errors".to_string()];
        structural.evidence_event_ids = stats.all_ids.clone();
        structural.procedural = procedural.clone();

        let mut environmental = ProposalContext::new(
            format!("Environmental noise in {target}"),
            target,
            "Errors might be due to transient fluctuations.",
            0.4,
        );
        environmental.strengths = vec!["More conservative".to_string()];
        environmental.evidence_event_ids = stats.all_ids.clone();
        environmental.procedural = procedural;

        let mut fids = Vec::new();
        for hypothesis in [structural, environmental] {
            if let Some(fid) = self.emit_proposal(hypothesis)? {
                fids.push(fid);
            }
        }
        Ok(fids)
    }

    /// Codify a repeatedly successful workflow
    fn generate_success_proposal(
        &self,
        target: &str,
        stats: &EvidenceCluster,
    ) -> Result<Option<String>> {
        let mut proposal = ProposalContext::new(
            format!("Best Practice for {target}"),
            target,
            format!(
                "Observed {} successful operations. This pattern should be formalized.",
                stats.successes
            ),
            0.6,
        );
        proposal.strengths = vec![
            "Based on verified positive outcomes".to_string(),
            "Codifies successful workflow".to_string(),
        ];
        proposal.evidence_event_ids = stats.all_ids.clone();
        proposal.procedural = self.distill_for_cluster(stats);
        self.emit_proposal(proposal)
    }

    /// Track active development detected through commits
    fn generate_evolution_proposal(
        &self,
        target: &str,
        stats: &EvidenceCluster,
    ) -> Result<Option<String>> {
        let summary: Vec<String> = stats
            .commit_events
            .iter()
            .filter_map(|e| {
                let msg = e
                    .context_str("full_message")
                    .filter(|m| !m.is_empty())
                    .unwrap_or(&e.content);
                msg.lines().next().map(String::from)
            })
            .take(3)
            .collect();

        let mut proposal = ProposalContext::new(
            format!("Evolving Pattern in {target}"),
            target,
            format!(
                "Active development detected ({} commits). Recent changes: {}.",
                stats.commits,
                summary.join("; ")
            ),
            0.5,
        );
        proposal.strengths = vec![
            "Reflects actual code changes".to_string(),
            "Keeps memory in sync with codebase".to_string(),
        ];
        proposal.evidence_event_ids = stats.all_ids.clone();
        if !stats.commit_events.is_empty() {
            let distiller = DistillationEngine::new(self.memory.episodic());
            let last = stats.commit_events.last().expect("nonempty");
            proposal.procedural = distiller
                .create_procedural_proposal(&stats.commit_events, last)
                .procedural;
        }
        self.emit_proposal(proposal)
    }

    // ========================================================================
    // DECAY AND LIFECYCLE
    // ========================================================================

    fn apply_decay(&self, fid: &str, ctx: &Value) -> Result<()> {
        let confidence = ctx.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let new_conf = (confidence - self.policy.decay_rate).max(0.0);

        let mut updates = serde_json::Map::new();
        updates.insert("confidence".into(), json!(new_conf));
        if new_conf < self.policy.min_confidence {
            updates.insert("status".into(), json!("rejected"));
            self.memory
                .update_decision(fid, &updates, "Reflection: Hypothesis rejected (decay).")?;
        } else {
            self.memory
                .update_decision(fid, &updates, "Reflection: Applied decay.")?;
        }
        Ok(())
    }

    fn check_proposal_lifecycle(&self, fid: &str, ctx: &Value, now: DateTime<Utc>) -> Result<()> {
        let ready = ctx
            .get("ready_for_review")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !ready {
            let first_seen = ctx
                .get("first_observed_at")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            if let Some(first_seen) = first_seen {
                if now - first_seen >= self.policy.observation_window
                    && ctx.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0)
                        >= self.policy.ready_threshold
                {
                    tracing::info!(fid, "proposal is now ready for review");
                    let mut updates = serde_json::Map::new();
                    updates.insert("ready_for_review".into(), json!(true));
                    self.memory.update_decision(
                        fid,
                        &updates,
                        "Reflection: Automatic readiness update.",
                    )?;
                }
            }
        }

        // Re-read the current state: earlier steps in this cycle may have
        // updated confidence or readiness
        let Some(meta) = self.memory.semantic().meta.get_by_fid(fid)? else {
            return Ok(());
        };
        let curr: Value = meta.context();
        let is_ready = curr
            .get("ready_for_review")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let confidence = curr.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let has_objections = curr
            .get("objections")
            .and_then(|v| v.as_array())
            .is_some_and(|a| !a.is_empty());

        if is_ready && confidence >= self.policy.auto_accept_threshold && !has_objections {
            tracing::info!(fid, "auto-accepting proposal");
            if let Err(e) = self.memory.accept_proposal(fid) {
                tracing::error!(fid, "auto-acceptance failed: {e}");
            }
        }
        Ok(())
    }

    fn draft_proposals(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .memory
            .semantic()
            .meta
            .list_draft_proposals()?
            .into_iter()
            .map(|m| {
                let ctx = m.context();
                (m.fid, ctx)
            })
            .collect())
    }
}
