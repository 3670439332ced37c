//! Decay: episodic aging and semantic confidence erosion.

use chrono::{Duration, Utc};
use ledgermind_e2e_tests::{open_memory, open_memory_with};
use ledgermind_core::{EventContext, EventKind, EventSource, MemoryConfig};
use serde_json::json;
use tempfile::TempDir;

/// Rewrite a metadata row with a backdated timestamp (delete + insert,
/// since upserts deliberately never touch timestamps).
fn backdate_row(memory: &ledgermind_core::Memory, fid: &str, days: i64) {
    let mut row = memory.semantic().meta.get_by_fid(fid).unwrap().unwrap();
    row.timestamp = (Utc::now() - Duration::days(days)).to_rfc3339();
    row.last_hit_at = None;
    memory.semantic().meta.delete(fid).unwrap();
    memory.semantic().meta.upsert(&row).unwrap();
}

#[test]
fn dormant_decision_deprecates_only_below_threshold() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let fid = memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // Two weeks inactive: a decision decays at a third of the base rate,
    // far above both thresholds -> confidence drops, status stays active
    backdate_row(&memory, &fid, 14);
    let report = memory.run_decay(false).unwrap();
    assert_eq!(report.semantic_decayed, 1);
    assert_eq!(report.semantic_deprecated, 0);

    let row = memory.semantic().meta.get_by_fid(&fid).unwrap().unwrap();
    assert_eq!(row.status, "active");
    assert!(row.confidence < 1.0);
}

#[test]
fn low_confidence_decision_becomes_deprecated() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let fid = memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // Push confidence just above the deprecation line, then age it
    let mut updates = serde_json::Map::new();
    updates.insert("confidence".into(), json!(0.51));
    memory.update_decision(&fid, &updates, "test setup").unwrap();
    backdate_row(&memory, &fid, 14);

    let report = memory.run_decay(false).unwrap();
    assert_eq!(report.semantic_deprecated, 1);
    let row = memory.semantic().meta.get_by_fid(&fid).unwrap().unwrap();
    assert_eq!(row.status, "deprecated");
}

#[test]
fn draft_proposals_decay_faster_and_can_be_forgotten() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let proposal_ctx = ledgermind_core::ProposalContext::new(
        "Fragile hypothesis",
        "flaky_area",
        "Might explain the intermittent failures.",
        0.12,
    );
    let fid = memory
        .process_event(
            EventSource::ReflectionEngine,
            EventKind::Proposal,
            "Fragile hypothesis",
            Some(EventContext::Proposal(Box::new(proposal_ctx))),
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // Proposals are draft status and skip decay; flip to active to age it
    let mut updates = serde_json::Map::new();
    updates.insert("status".into(), json!("active"));
    memory.update_decision(&fid, &updates, "test setup").unwrap();
    backdate_row(&memory, &fid, 70);

    let report = memory.run_decay(false).unwrap();
    assert_eq!(report.semantic_forgotten, 1);
    assert!(memory.semantic().meta.get_by_fid(&fid).unwrap().is_none());
    assert!(!memory.semantic().repo_path().join(&fid).exists());
}

#[test]
fn episodic_decay_respects_immortal_links() {
    let dir = TempDir::new().unwrap();
    let config = MemoryConfig {
        ttl_days: 7,
        ..Default::default()
    };
    let memory = open_memory_with(dir.path(), config);

    // A linked event and a loose one, both older than the TTL
    let decision_id = memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    let linked = memory
        .process_event(
            EventSource::Agent,
            EventKind::Result,
            "formatting verified",
            None,
            None,
            None,
        )
        .unwrap()
        .event_id()
        .unwrap();
    memory.link_evidence(linked, &decision_id).unwrap();

    let loose = memory
        .process_event(
            EventSource::Agent,
            EventKind::Result,
            "unrelated chatter",
            None,
            None,
            None,
        )
        .unwrap()
        .event_id()
        .unwrap();

    // Backdate both events past the TTL, straight in the log
    let old = (Utc::now() - Duration::days(30)).to_rfc3339();
    backdate_events(&memory, &[linked, loose], &old);

    // First pass archives the loose event; the linked one is retained
    let report = memory.run_decay(false).unwrap();
    assert!(report.retained_by_link >= 1);
    assert_eq!(report.archived, 1);

    // Second pass prunes the archived loose event; the linked one stays
    let report = memory.run_decay(false).unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(memory.episodic().get_by_ids(&[linked]).unwrap().len(), 1);
    assert!(memory.episodic().get_by_ids(&[loose]).unwrap().is_empty());
}

/// Backdate events by rewriting their timestamps through a throwaway
/// connection to the same database file.
fn backdate_events(memory: &ledgermind_core::Memory, ids: &[i64], timestamp: &str) {
    let conn = rusqlite_open(memory.episodic().db_path());
    for id in ids {
        conn.execute(
            "UPDATE events SET timestamp = ?1 WHERE id = ?2",
            (timestamp, id),
        )
        .unwrap();
    }
}

fn rusqlite_open(path: &std::path::Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).unwrap()
}

#[test]
fn dry_run_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let fid = memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();
    backdate_row(&memory, &fid, 30);

    let report = memory.run_decay(true).unwrap();
    assert!(report.semantic_decayed >= 1);

    // Nothing was actually written
    let row = memory.semantic().meta.get_by_fid(&fid).unwrap().unwrap();
    assert!((row.confidence - 1.0).abs() < 1e-9);
    assert_eq!(row.status, "active");
}
