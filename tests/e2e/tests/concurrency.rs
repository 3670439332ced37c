//! Concurrent writers racing on the same target.

use std::sync::Arc;

use ledgermind_e2e_tests::open_memory;
use ledgermind_core::MemoryError;
use tempfile::TempDir;

#[test]
fn concurrent_recorders_leave_single_active_decision() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(open_memory(dir.path()));

    let mut handles = Vec::new();
    for worker in 0..2 {
        let memory = memory.clone();
        handles.push(std::thread::spawn(move || {
            // Deliberately dissimilar content so similarity-based
            // auto-resolution cannot kick in
            if worker == 0 {
                memory.record_decision(
                    "Serialize writes through one queue",
                    "ingest_path",
                    "Ordering matters for replay correctness.",
                    None,
                    None,
                    None,
                    None,
                )
            } else {
                memory.record_decision(
                    "Shard by tenant id across workers",
                    "ingest_path",
                    "Throughput requirements dominate here entirely.",
                    None,
                    None,
                    None,
                    None,
                )
            }
        }));
    }

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(MemoryError::Conflict(_)) | Err(MemoryError::LockTimeout(_))
            )
        })
        .count();

    assert_eq!(successes, 1, "exactly one writer must win: {outcomes:?}");
    assert_eq!(conflicts, 1, "the loser surfaces a conflict or timeout");

    // The unique-active invariant holds afterwards
    let active = memory.list_active_conflicts("ingest_path").unwrap();
    assert!(active.len() <= 1);
}

#[test]
fn concurrent_episodic_appends_preserve_ordering() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(open_memory(dir.path()));

    let mut handles = Vec::new();
    for worker in 0..4 {
        let memory = memory.clone();
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..10 {
                let decision = memory
                    .process_event(
                        ledgermind_core::EventSource::Agent,
                        ledgermind_core::EventKind::Result,
                        &format!("worker {worker} step {i}"),
                        None,
                        None,
                        None,
                    )
                    .unwrap();
                ids.push(decision.event_id().unwrap());
            }
            ids
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        // Ids are strictly increasing within each worker
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        all_ids.extend(ids);
    }
    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 40, "no id was handed out twice");
}

#[test]
fn namespaces_do_not_contend() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(open_memory(dir.path()));

    let mut handles = Vec::new();
    for ns in ["team-a", "team-b"] {
        let memory = memory.clone();
        handles.push(std::thread::spawn(move || {
            memory.record_decision(
                "Use tabs",
                "style",
                "Align with team convention.",
                None,
                None,
                Some(ns),
                None,
            )
        }));
    }

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    // One active decision per namespace
    assert_eq!(
        memory
            .semantic()
            .list_active_conflicts("style", "team-a")
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        memory
            .semantic()
            .list_active_conflicts("style", "team-b")
            .unwrap()
            .len(),
        1
    );
}
