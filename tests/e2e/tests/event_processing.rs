//! Event routing, duplicate suppression, boundaries, and maintenance.

use ledgermind_e2e_tests::{open_memory, open_memory_with};
use ledgermind_core::{
    EventContext, EventKind, EventSource, MemoryConfig, MemoryError, SearchMode, StoreType,
    TrustBoundary,
};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn identical_events_collapse_to_one_row() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    // Replaying the same logical event (identical tuple including the
    // timestamp, as a history ingester would) collapses to one row
    let event = ledgermind_core::MemoryEvent::new(
        EventSource::Agent,
        EventKind::Result,
        "tests passed",
        Some(EventContext::Map(json!({"target": "ci", "run": 12}))),
    )
    .unwrap();

    let id1 = memory.episodic().append(&event, None, 1.0).unwrap();
    let id2 = memory.episodic().append(&event, None, 1.0).unwrap();
    assert_eq!(id1, id2);
    assert_eq!(memory.episodic().count_events(None).unwrap(), 1);

    // The same fields at a different time are a new observation
    let mut later = event.clone();
    later.timestamp = event.timestamp + chrono::Duration::seconds(1);
    let id3 = memory.episodic().append(&later, None, 1.0).unwrap();
    assert_ne!(id1, id3);
}

#[test]
fn routing_splits_episodic_and_semantic() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let episodic = memory
        .process_event(
            EventSource::User,
            EventKind::Prompt,
            "please fix the flaky test",
            None,
            None,
            None,
        )
        .unwrap();
    assert_eq!(episodic.store_type, StoreType::Episodic);
    assert!(episodic.event_id().is_some());

    let semantic = memory
        .process_event(
            EventSource::Agent,
            EventKind::Constraint,
            "never commit directly to main",
            Some(EventContext::Map(json!({
                "title": "Protect main",
                "target": "branch_policy",
                "rationale": "History must stay reviewable.",
            }))),
            None,
            None,
        )
        .unwrap();
    assert_eq!(semantic.store_type, StoreType::Semantic);
    let fid = semantic.file_id().unwrap();
    assert!(fid.starts_with("constraint_"));
    assert!(memory.semantic().repo_path().join(fid).exists());
}

#[test]
fn trust_boundary_denies_agent_decisions_only() {
    let dir = TempDir::new().unwrap();
    let config = MemoryConfig {
        trust_boundary: TrustBoundary::HumanOnly,
        ..Default::default()
    };
    let memory = open_memory_with(dir.path(), config);

    let denied = memory
        .process_event(
            EventSource::Agent,
            EventKind::Decision,
            "agent wants to decide",
            Some(EventContext::Map(json!({
                "title": "T", "target": "style", "rationale": "Because I computed it.",
            }))),
            None,
            None,
        )
        .unwrap();
    assert!(!denied.should_persist);
    assert_eq!(denied.reason, "Trust Boundary Violation");

    // Episodic writes from agents still flow
    let allowed = memory
        .process_event(
            EventSource::Agent,
            EventKind::Result,
            "observation only",
            None,
            None,
            None,
        )
        .unwrap();
    assert!(allowed.should_persist);
}

#[test]
fn sanitization_boundaries_hold_end_to_end() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    // Rationale length 9 rejected, 10 accepted
    let err = memory
        .record_decision("T", "style", "123456789", None, None, None, None)
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    memory
        .record_decision("T", "style", "1234567890", None, None, None, None)
        .unwrap();

    // Bad namespaces are rejected before anything is written
    let err = memory
        .record_decision(
            "T",
            "other_target",
            "a valid rationale here",
            None,
            None,
            Some("prod/x"),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    // Dangerous content never reaches the log
    let err = memory
        .process_event(
            EventSource::User,
            EventKind::Prompt,
            "click javascript:alert(1)",
            None,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[test]
fn update_with_no_changes_is_a_noop() {
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

    let head_before = memory.semantic().get_head_hash();
    let mut updates = serde_json::Map::new();
    updates.insert("status".into(), json!("active"));
    memory.update_decision(&fid, &updates, "no-op").unwrap();
    // No new audit commit was produced
    assert_eq!(memory.semantic().get_head_hash(), head_before);
}

#[test]
fn knowledge_graph_renders_the_chain() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let first = memory
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
    memory
        .supersede_decision(
            "Use spaces",
            "style",
            "Switching to spaces per ADR-42.",
            &[first],
            None,
            None,
            None,
        )
        .unwrap();

    let graph = memory.generate_knowledge_graph(Some("style")).unwrap();
    assert!(graph.starts_with("graph TD"));
    assert!(graph.contains("superseded by"));
    assert!(graph.contains("Use spaces"));
}

#[test]
fn maintenance_reports_are_coherent() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            None,
            None,
        )
        .unwrap();

    let report = memory.run_maintenance().unwrap();
    assert_eq!(report.integrity, "ok");

    let stats = memory.get_stats().unwrap();
    assert_eq!(stats.semantic_records, 1);
    assert!(stats.active_events >= 1);
}

#[test]
fn environment_check_reports_readiness() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let report = memory.check_environment();
    assert!(report.storage_writable);
    assert!(report.vector_available);
    assert!(report.repo_healthy);
    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
}

#[test]
fn namespace_isolation_in_search() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    memory
        .record_decision(
            "Use tabs",
            "style",
            "Align with team convention.",
            None,
            None,
            Some("team-a"),
            None,
        )
        .unwrap();
    memory
        .record_decision(
            "Use spaces",
            "style",
            "This team prefers spaces everywhere.",
            None,
            None,
            Some("team-b"),
            None,
        )
        .unwrap();

    let a = memory
        .search_decisions("tabs spaces", 10, 0, Some("team-a"), SearchMode::Balanced)
        .unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].title, "Use tabs");

    let b = memory
        .search_decisions("tabs spaces", 10, 0, Some("team-b"), SearchMode::Balanced)
        .unwrap();
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].title, "Use spaces");
}

#[test]
fn conflicting_record_without_resolution_surfaces_suggestions() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    memory
        .record_decision(
            "Serialize writes through one queue",
            "ingest_path",
            "Ordering matters for replay correctness.",
            None,
            None,
            None,
            None,
        )
        .unwrap();

    // Dissimilar content for the same target: hard conflict
    let err = memory
        .record_decision(
            "Shard by tenant id across workers",
            "ingest_path",
            "Throughput requirements dominate here entirely.",
            None,
            None,
            None,
            None,
        )
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("CONFLICT"));
    assert!(msg.contains("ingest_path"));
}

#[test]
fn interventions_enter_the_lifecycle_as_emergent() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let mut stream = ledgermind_core::DecisionStream::new(
        "release_cadence",
        "Freeze releases on Fridays",
        "An operator stepped in after the outage.",
    );
    stream.phase = ledgermind_core::DecisionPhase::Pattern;

    let decision = memory
        .process_event(
            EventSource::User,
            EventKind::Intervention,
            "freeze releases on fridays",
            Some(EventContext::Stream(Box::new(stream))),
            None,
            None,
        )
        .unwrap();
    let fid = decision.file_id().unwrap();

    let (doc, _) = memory.semantic().load_artifact(fid).unwrap();
    assert_eq!(doc.context_str("phase"), Some("emergent"));
    assert_eq!(doc.context_str("scope"), Some("system"));
    let cost = doc
        .context
        .get("estimated_removal_cost")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((cost - 0.8).abs() < 1e-9);
    let confidence = doc.context.get("confidence").and_then(|v| v.as_f64()).unwrap();
    assert!((confidence - 0.7).abs() < 1e-9);
}

#[test]
fn similar_decision_auto_supersedes() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let first = memory
        .record_decision(
            "Use tabs for indentation in source files",
            "style",
            "Align with the existing team convention everywhere.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // Near-identical wording: the hashing embedder scores this well above
    // the auto-supersede threshold
    let second = memory
        .record_decision(
            "Use tabs for indentation in source files always",
            "style",
            "Align with the existing team convention everywhere now.",
            None,
            None,
            None,
            None,
        )
        .unwrap();

    let new_id = second.file_id().unwrap().to_string();
    assert_ne!(new_id, first);
    let old_row = memory.semantic().meta.get_by_fid(&first).unwrap().unwrap();
    assert_eq!(old_row.status, "superseded");
    assert_eq!(old_row.superseded_by.as_deref(), Some(new_id.as_str()));
    // The auto-evolution rationale is recorded on the successor
    let (doc, _) = memory.semantic().load_artifact(&new_id).unwrap();
    assert!(doc
        .context_str("rationale")
        .unwrap()
        .starts_with("Auto-Evolution"));
}
