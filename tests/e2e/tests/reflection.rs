//! Reflection: clustering, hypothesis generation, and the watermark.

use ledgermind_e2e_tests::open_memory;
use ledgermind_core::{EventContext, EventKind, EventSource};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn error_cluster_produces_competing_hypotheses() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let mut max_event_id = 0;
    for i in 0..5 {
        let decision = memory
            .process_event(
                EventSource::Agent,
                EventKind::Error,
                &format!("connection refused during attempt {i}"),
                Some(EventContext::Map(json!({"target": "db_conn", "attempt": i}))),
                None,
                None,
            )
            .unwrap();
        max_event_id = decision.event_id().unwrap();
    }

    let proposal_ids = memory.run_reflection().unwrap();
    assert_eq!(proposal_ids.len(), 2, "two competing hypotheses expected");

    let titles: Vec<String> = proposal_ids
        .iter()
        .map(|fid| memory.semantic().meta.get_by_fid(fid).unwrap().unwrap().title)
        .collect();
    assert!(titles.contains(&"Structural flaw in db_conn".to_string()));
    assert!(titles.contains(&"Environmental noise in db_conn".to_string()));

    // The watermark advanced to the highest processed event id
    let watermark: i64 = memory
        .semantic()
        .meta
        .get_config("last_reflection_event_id")
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(watermark, max_event_id);
}

#[test]
fn reflection_is_incremental() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    for i in 0..3 {
        memory
            .process_event(
                EventSource::Agent,
                EventKind::Error,
                &format!("timeout in worker {i}"),
                Some(EventContext::Map(json!({"target": "job_queue"}))),
                None,
                None,
            )
            .unwrap();
    }
    let first_run = memory.run_reflection().unwrap();
    assert!(!first_run.is_empty());

    // Re-running with no new events does not duplicate hypotheses
    let drafts_before = memory.semantic().meta.list_draft_proposals().unwrap().len();
    memory.run_reflection().unwrap();
    let drafts_after = memory.semantic().meta.list_draft_proposals().unwrap().len();
    assert!(drafts_after <= drafts_before);
}

#[test]
fn successful_trajectories_are_distilled_into_procedures() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let steps = [
        (EventKind::Task, "investigate slow deploy pipeline"),
        (EventKind::Call, "profile the artifact upload stage"),
        (EventKind::Call, "parallelize artifact uploads"),
    ];
    for (kind, content) in steps {
        memory
            .process_event(
                EventSource::Agent,
                kind,
                content,
                Some(EventContext::Map(
                    json!({"target": "deploy_flow", "rationale": "Working through the deploy slowdown."}),
                )),
                None,
                None,
            )
            .unwrap();
    }
    memory
        .process_event(
            EventSource::Agent,
            EventKind::Result,
            "deploy time halved",
            Some(EventContext::Map(json!({"target": "deploy_flow", "success": true}))),
            None,
            None,
        )
        .unwrap();

    memory.run_reflection().unwrap();
    let drafts = memory.semantic().meta.list_draft_proposals().unwrap();
    let procedural: Vec<_> = drafts
        .iter()
        .filter(|d| d.title == "Procedural Optimization for deploy_flow")
        .collect();
    assert!(
        !procedural.is_empty(),
        "expected a distilled procedural proposal, got {:?}",
        drafts.iter().map(|d| &d.title).collect::<Vec<_>>()
    );
    // Distilled steps survive in the stored context
    let ctx = procedural[0].context();
    let steps = ctx
        .get("procedural")
        .and_then(|p| p.get("steps"))
        .and_then(|s| s.as_array())
        .expect("procedural steps present");
    assert!(!steps.is_empty());
}

#[test]
fn blacklisted_targets_are_ignored() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    for i in 0..4 {
        memory
            .process_event(
                EventSource::Agent,
                EventKind::Error,
                &format!("vague failure {i}"),
                Some(EventContext::Map(json!({"target": "general"}))),
                None,
                None,
            )
            .unwrap();
    }

    let proposal_ids = memory.run_reflection().unwrap();
    assert!(proposal_ids.is_empty());
}

#[test]
fn commit_activity_produces_evolving_pattern() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    for i in 0..3 {
        memory
            .process_event(
                EventSource::System,
                EventKind::CommitChange,
                &format!("refactor(parser): pass {i} of the cleanup"),
                Some(EventContext::Map(json!({
                    "target": "parser",
                    "hash": format!("{i}{i}{i}abc"),
                    "full_message": format!("cleanup pass {i}")
                }))),
                None,
                None,
            )
            .unwrap();
    }

    memory.run_reflection().unwrap();
    let drafts = memory.semantic().meta.list_draft_proposals().unwrap();
    assert!(drafts.iter().any(|d| d.title == "Evolving Pattern in parser"));
}
