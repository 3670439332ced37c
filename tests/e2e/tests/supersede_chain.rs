//! Record -> supersede -> search: the knowledge evolution happy path.

use ledgermind_e2e_tests::open_memory;
use ledgermind_core::{MemoryError, SearchMode};
use tempfile::TempDir;

#[test]
fn record_then_supersede_builds_bidirectional_chain() {
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
        .unwrap();
    let first_id = first.file_id().unwrap().to_string();

    let second = memory
        .supersede_decision(
            "Use spaces",
            "style",
            "Switching to spaces per ADR-42.",
            &[first_id.clone()],
            None,
            None,
            None,
        )
        .unwrap();
    let second_id = second.file_id().unwrap().to_string();

    // Two artifacts; the first superseded with a closed backlink
    let first_row = memory.semantic().meta.get_by_fid(&first_id).unwrap().unwrap();
    assert_eq!(first_row.status, "superseded");
    assert_eq!(first_row.superseded_by.as_deref(), Some(second_id.as_str()));

    let (second_doc, _) = memory.semantic().load_artifact(&second_id).unwrap();
    assert_eq!(second_doc.context_list("supersedes"), vec![first_id.clone()]);

    // Truth resolution lands on the successor
    let head = memory
        .semantic()
        .meta
        .resolve_to_truth(&first_id, false)
        .unwrap()
        .unwrap();
    assert_eq!(head.fid, second_id);

    // Strict search returns only the active head
    let strict = memory
        .search_decisions("spaces", 5, 0, None, SearchMode::Strict)
        .unwrap();
    assert_eq!(strict.len(), 1);
    assert_eq!(strict[0].id, second_id);
    assert!(strict[0].is_active);

    // Audit search sees both generations
    let audit = memory
        .search_decisions("tabs spaces convention", 10, 0, None, SearchMode::Audit)
        .unwrap();
    let ids: Vec<&str> = audit.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.contains(&first_id.as_str()));
    assert!(ids.contains(&second_id.as_str()));
}

#[test]
fn chained_supersedes_resolve_to_head() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let mut current = memory
        .record_decision(
            "Generation 0",
            "retry_policy",
            "Initial retry policy decision.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();
    let genesis = current.clone();

    for i in 1..=4 {
        current = memory
            .supersede_decision(
                &format!("Generation {i}"),
                "retry_policy",
                &format!("Refinement number {i} of the policy."),
                &[current.clone()],
                None,
                None,
                None,
            )
            .unwrap()
            .file_id()
            .unwrap()
            .to_string();
    }

    let head = memory
        .semantic()
        .meta
        .resolve_to_truth(&genesis, false)
        .unwrap()
        .unwrap();
    assert_eq!(head.fid, current);
    assert_eq!(head.status, "active");

    // Only one active decision for the target survives
    assert_eq!(memory.list_active_conflicts("retry_policy").unwrap().len(), 1);
}

#[test]
fn superseding_inactive_decision_is_refused() {
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
            &[first.clone()],
            None,
            None,
            None,
        )
        .unwrap();

    // The first decision is no longer active
    let err = memory
        .supersede_decision(
            "Use something else",
            "style",
            "Trying to supersede a stale id.",
            &[first],
            None,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::Conflict(_)));
}

#[test]
fn audit_history_tracks_the_evolution() {
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
            &[first.clone()],
            None,
            None,
            None,
        )
        .unwrap();

    // The superseded artifact carries at least its creation in history,
    // and the store has a head commit
    let history = memory.get_decision_history(&first).unwrap();
    assert!(!history.is_empty());
    assert!(memory.semantic().get_head_hash().is_some());
}
