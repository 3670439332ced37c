//! Decay engine - age-based episodic lifecycle and inactivity-based
//! semantic confidence decay.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::frontmatter::parse_timestamp;
use crate::storage::{EpisodicEvent, MetaRow};

/// Summary of one decay run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DecayReport {
    /// Episodic events moved to archived
    pub archived: usize,
    /// Episodic events physically pruned
    pub pruned: usize,
    /// Events retained by link or protected kind
    pub retained_by_link: usize,
    /// Semantic records physically forgotten
    pub semantic_forgotten: usize,
    /// Semantic records whose confidence was reduced
    pub semantic_decayed: usize,
    /// Active decisions demoted to deprecated
    pub semantic_deprecated: usize,
}

/// Fate of one semantic record after evaluation
#[derive(Debug, Clone)]
pub struct SemanticDecay {
    /// Record id
    pub fid: String,
    /// Confidence after decay
    pub new_confidence: f64,
    /// Whether the record fell below the forget threshold
    pub should_forget: bool,
}

/// Engine for managing the lifecycle of memories
pub struct DecayEngine {
    ttl_days: i64,
    semantic_decay_rate: f64,
    forget_threshold: f64,
}

impl DecayEngine {
    /// Build an engine with the given TTL and decay knobs
    pub fn new(ttl_days: i64, semantic_decay_rate: f64, forget_threshold: f64) -> Self {
        Self {
            ttl_days,
            semantic_decay_rate,
            forget_threshold,
        }
    }

    /// Decide the fate of episodic events.
    ///
    /// Linked events and protected kinds (decision, constraint) are kept
    /// forever. Past the TTL, active events archive and archived events
    /// queue for physical pruning (I2 is re-checked at execution).
    ///
    /// Returns (archive ids, prune ids, retained count).
    pub fn evaluate(&self, events: &[EpisodicEvent], now: DateTime<Utc>) -> (Vec<i64>, Vec<i64>, usize) {
        let ttl = Duration::days(self.ttl_days);
        let mut to_archive = Vec::new();
        let mut to_prune = Vec::new();
        let mut retained = 0usize;

        for ev in events {
            if ev.linked_id.is_some() || matches!(ev.kind.as_str(), "decision" | "constraint") {
                retained += 1;
                continue;
            }
            // Unparseable timestamps are treated as very old
            let ts = parse_timestamp(&ev.timestamp).unwrap_or(DateTime::<Utc>::MIN_UTC);
            if now - ts > ttl {
                if ev.status == "active" {
                    to_archive.push(ev.id);
                } else {
                    to_prune.push(ev.id);
                }
            }
        }
        (to_archive, to_prune, retained)
    }

    /// Calculate confidence decay for semantic records.
    ///
    /// Only active and deprecated records decay. Decisions, constraints,
    /// and assumptions decay at a third of the base rate; one decay step
    /// is applied per full week of inactivity beyond the first.
    pub fn evaluate_semantic(&self, rows: &[MetaRow], now: DateTime<Utc>) -> Vec<SemanticDecay> {
        let mut results = Vec::new();
        for row in rows {
            if !matches!(row.status.as_str(), "active" | "deprecated") {
                continue;
            }
            let effective_rate = if matches!(row.kind.as_str(), "decision" | "constraint" | "assumption")
            {
                self.semantic_decay_rate / 3.0
            } else {
                self.semantic_decay_rate
            };

            let last_hit = row
                .last_hit_at
                .as_deref()
                .and_then(parse_timestamp)
                .or_else(|| parse_timestamp(&row.timestamp))
                .unwrap_or_else(|| now - Duration::days(self.ttl_days));

            let days_inactive = (now - last_hit).num_days();
            if days_inactive > 7 {
                let decay_steps = (days_inactive / 7) as f64;
                let new_conf =
                    ((row.confidence - effective_rate * decay_steps).max(0.0) * 100.0).round() / 100.0;
                results.push(SemanticDecay {
                    fid: row.fid.clone(),
                    new_confidence: new_conf,
                    should_forget: new_conf < self.forget_threshold,
                });
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn episodic(id: i64, kind: &str, status: &str, age_days: i64, linked: Option<&str>) -> EpisodicEvent {
        EpisodicEvent {
            id,
            source: "agent".into(),
            kind: kind.into(),
            content: "x".into(),
            context: Value::Null,
            timestamp: (Utc::now() - Duration::days(age_days)).to_rfc3339(),
            status: status.into(),
            linked_id: linked.map(String::from),
            link_strength: 1.0,
        }
    }

    fn meta(fid: &str, kind: &str, status: &str, confidence: f64, inactive_days: i64) -> MetaRow {
        MetaRow {
            fid: fid.into(),
            target: "t".into(),
            title: String::new(),
            status: status.into(),
            kind: kind.into(),
            timestamp: (Utc::now() - Duration::days(inactive_days)).to_rfc3339(),
            superseded_by: None,
            content: String::new(),
            keywords: String::new(),
            confidence,
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

    #[test]
    fn test_episodic_lifecycle() {
        let engine = DecayEngine::new(30, 0.05, 0.1);
        let events = vec![
            episodic(1, "result", "active", 40, None),     // archive
            episodic(2, "result", "archived", 40, None),   // prune
            episodic(3, "result", "active", 5, None),      // fresh, untouched
            episodic(4, "result", "active", 40, Some("d.md")), // linked, immortal
            episodic(5, "decision", "active", 40, None),   // protected kind
        ];
        let (archive, prune, retained) = engine.evaluate(&events, Utc::now());
        assert_eq!(archive, vec![1]);
        assert_eq!(prune, vec![2]);
        assert_eq!(retained, 2);
    }

    #[test]
    fn test_semantic_decay_rates() {
        let engine = DecayEngine::new(30, 0.05, 0.1);
        let rows = vec![
            meta("proposal.md", "proposal", "active", 1.0, 14),
            meta("decision.md", "decision", "active", 1.0, 14),
        ];
        let results = engine.evaluate_semantic(&rows, Utc::now());
        assert_eq!(results.len(), 2);

        // 2 weeks inactive: proposals lose 0.05 * 2, decisions a third of that
        let proposal = results.iter().find(|r| r.fid == "proposal.md").unwrap();
        assert!((proposal.new_confidence - 0.9).abs() < 1e-9);
        let decision = results.iter().find(|r| r.fid == "decision.md").unwrap();
        assert!((decision.new_confidence - 0.97).abs() < 1e-9);
    }

    #[test]
    fn test_recent_records_do_not_decay() {
        let engine = DecayEngine::new(30, 0.05, 0.1);
        let rows = vec![meta("fresh.md", "decision", "active", 1.0, 3)];
        assert!(engine.evaluate_semantic(&rows, Utc::now()).is_empty());
    }

    #[test]
    fn test_forget_threshold() {
        let engine = DecayEngine::new(30, 0.05, 0.1);
        // Long-dormant proposal with little confidence left
        let rows = vec![meta("stale.md", "proposal", "active", 0.12, 70)];
        let results = engine.evaluate_semantic(&rows, Utc::now());
        assert!(results[0].should_forget);
        assert_eq!(results[0].new_confidence, 0.0);
    }

    #[test]
    fn test_superseded_records_skip_decay() {
        let engine = DecayEngine::new(30, 0.05, 0.1);
        let rows = vec![meta("old.md", "decision", "superseded", 1.0, 100)];
        assert!(engine.evaluate_semantic(&rows, Utc::now()).is_empty());
    }
}
