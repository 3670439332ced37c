//! Proposal review: acceptance, conversion, rejection, and rollback.

use ledgermind_e2e_tests::open_memory;
use ledgermind_core::{
    EventContext, EventKind, EventSource, MemoryError, ProposalContext,
};
use tempfile::TempDir;

fn draft_proposal(memory: &ledgermind_core::Memory, target: &str, supersedes: Vec<String>) -> String {
    let mut ctx = ProposalContext::new(
        format!("Hypothesis about {target}"),
        target,
        "Derived from repeated observations in the log.",
        0.7,
    );
    ctx.suggested_supersedes = supersedes;
    ctx.suggested_consequences = vec!["Workflow changes slightly".to_string()];
    let title = ctx.title.clone();
    memory
        .process_event(
            EventSource::ReflectionEngine,
            EventKind::Proposal,
            &title,
            Some(EventContext::Proposal(Box::new(ctx))),
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string()
}

#[test]
fn accepting_a_plain_proposal_creates_decision() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let proposal_id = draft_proposal(&memory, "cache_layer", vec![]);
    let decision = memory.accept_proposal(&proposal_id).unwrap();
    let new_id = decision.file_id().unwrap().to_string();

    // The proposal flipped to accepted and records its conversion
    let (doc, _) = memory.semantic().load_artifact(&proposal_id).unwrap();
    assert_eq!(doc.context_str("status"), Some("accepted"));
    assert_eq!(doc.context_str("converted_to"), Some(new_id.as_str()));

    // The new decision is the active truth for the target
    let active = memory.list_active_conflicts("cache_layer").unwrap();
    assert_eq!(active, vec![new_id]);
}

#[test]
fn accepting_with_suggested_supersedes_replaces_predecessor() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let old_id = memory
        .record_decision(
            "Cache everything for an hour",
            "cache_layer",
            "Simple TTL was good enough at first.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    let proposal_id = draft_proposal(&memory, "cache_layer", vec![old_id.clone()]);
    let decision = memory.accept_proposal(&proposal_id).unwrap();
    let new_id = decision.file_id().unwrap().to_string();

    let old_row = memory.semantic().meta.get_by_fid(&old_id).unwrap().unwrap();
    assert_eq!(old_row.status, "superseded");
    assert_eq!(old_row.superseded_by.as_deref(), Some(new_id.as_str()));

    let (new_doc, _) = memory.semantic().load_artifact(&new_id).unwrap();
    assert_eq!(new_doc.context_list("supersedes"), vec![old_id]);

    let (prop_doc, _) = memory.semantic().load_artifact(&proposal_id).unwrap();
    assert_eq!(prop_doc.context_str("status"), Some("accepted"));
}

#[test]
fn failed_acceptance_rolls_back_to_draft() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let old_id = memory
        .record_decision(
            "Cache everything for an hour",
            "cache_layer",
            "Simple TTL was good enough at first.",
            None,
            None,
            None,
            None,
        )
        .unwrap()
        .file_id()
        .unwrap()
        .to_string();

    let proposal_id = draft_proposal(&memory, "cache_layer", vec![old_id.clone()]);

    // Invalidate the proposal's plan: the suggested predecessor is
    // superseded by someone else first
    memory
        .supersede_decision(
            "Layered cache with stampede control",
            "cache_layer",
            "Thundering herds invalidated the TTL design.",
            &[old_id],
            None,
            None,
            None,
        )
        .unwrap();

    let err = memory.accept_proposal(&proposal_id).unwrap_err();
    assert!(matches!(err, MemoryError::Conflict(_)));

    // Rollback left the proposal a draft
    let (doc, _) = memory.semantic().load_artifact(&proposal_id).unwrap();
    assert_eq!(doc.context_str("status"), Some("draft"));
}

#[test]
fn accepting_twice_is_refused() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let proposal_id = draft_proposal(&memory, "cache_layer", vec![]);
    memory.accept_proposal(&proposal_id).unwrap();

    let err = memory.accept_proposal(&proposal_id).unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    assert!(err.to_string().contains("already accepted"));
}

#[test]
fn rejecting_a_proposal_records_the_reason() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

    let proposal_id = draft_proposal(&memory, "cache_layer", vec![]);
    memory
        .reject_proposal(&proposal_id, "Not enough evidence yet")
        .unwrap();

    let (doc, _) = memory.semantic().load_artifact(&proposal_id).unwrap();
    assert_eq!(doc.context_str("status"), Some("rejected"));
    assert_eq!(
        doc.context_str("rejection_reason"),
        Some("Not enough evidence yet")
    );
}

#[test]
fn non_proposal_artifacts_cannot_be_accepted() {
    let dir = TempDir::new().unwrap();
    let memory = open_memory(dir.path());

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

    let err = memory.accept_proposal(&decision_id).unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    let missing = memory.accept_proposal("proposal_nonexistent.md").unwrap_err();
    assert!(matches!(missing, MemoryError::NotFound(_)));

    let escape = memory.accept_proposal("../outside.md").unwrap_err();
    assert!(matches!(escape, MemoryError::Validation(_)));
}
