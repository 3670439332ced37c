//! Evidence linking and its effect on retrieval ranking.

use ledgermind_e2e_tests::open_memory;
use ledgermind_core::{EventContext, EventKind, EventSource, SearchMode};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn linked_evidence_boosts_search_score() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let decision_id = memory
        .record_decision(
            "Pool database connections",
            "db_conn",
            "Connection churn was exhausting the server.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // Three episodic results linked as supporting evidence
    for i in 0..3 {
        let decision = memory
            .process_event(
                EventSource::Agent,
                EventKind::Result,
                &format!("pool behaved correctly under load test {i}"),
                Some(EventContext::Map(json!({"target": "db_conn", "run": i}))),
                None,
                None,
            )
            .unwrap();
        memory
            .link_evidence(decision.event_id().unwrap(), &decision_id)
            .unwrap();
    }

    // 3 manual links + 1 self-link from the creating event
    let (count, _strength) = memory
        .episodic()
        .count_links_for_semantic(&decision_id)
        .unwrap();
    assert_eq!(count, 4);

    let results = memory
        .search_decisions("database connections pool", 5, 0, None, SearchMode::Balanced)
        .unwrap();
    assert_eq!(results[0].id, decision_id);
    assert_eq!(results[0].evidence_count, 4);
    // Evidence boost saturates: 1 + min(4 * 0.2, 1.0) = 1.8
    assert!(results[0].score > 0.0);
}

#[test]
fn links_are_inherited_through_supersede() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let first = memory
        .record_decision(
            "Pool database connections",
            "db_conn",
            "Connection churn was exhausting the server.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    let event = memory
        .process_event(
            EventSource::Agent,
            EventKind::Result,
            "pool verified in production",
            Some(EventContext::Map(json!({"target": "db_conn"}))),
            None,
            None,
        )
        .unwrap();
    memory.link_evidence(event.event_id().unwrap(), &first).unwrap();

    let second = memory
        .supersede_decision(
            "Pool with a hard cap",
            "db_conn",
            "Unbounded pools caused memory pressure.",
            &[first.clone()],
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    // The successor inherited every predecessor link
    let (count, _) = memory.episodic().count_links_for_semantic(&second).unwrap();
    assert!(count >= 3, "expected inherited links plus self-link, got {count}");

    // Immortality: pruning never removes linked events
    let linked_ids = memory.episodic().get_linked_event_ids(&second).unwrap();
    memory.episodic().physical_prune(&linked_ids).unwrap();
    assert_eq!(
        memory.episodic().get_by_ids(&linked_ids).unwrap().len(),
        linked_ids.len()
    );
}

#[test]
fn forget_unlinks_and_removes_everywhere() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let decision_id = memory
        .record_decision(
            "Pool database connections",
            "db_conn",
            "Connection churn was exhausting the server.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    memory.forget(&decision_id).unwrap();

    assert!(memory.semantic().meta.get_by_fid(&decision_id).unwrap().is_none());
    assert!(!memory.semantic().repo_path().join(&decision_id).exists());
    let (count, _) = memory
        .episodic()
        .count_links_for_semantic(&decision_id)
        .unwrap();
    assert_eq!(count, 0);

    // The previously linked creation event survives, now prunable
    assert!(memory.episodic().count_events(Some("active")).unwrap() >= 1);
}
