//! Router - decides whether an event is persisted and to which store.
//!
//! Pure decision logic over (event, intent, trust boundary). Conflicts for
//! decision events require a resolution intent that covers every
//! conflicting file; policy denials come back as non-persisting decisions
//! with a reason rather than errors.

use crate::error::Result;
use crate::reasoning::conflict::{ConflictEngine, ResolutionEngine};
use crate::schema::{
    EventKind, EventSource, MemoryDecision, MemoryEvent, ResolutionIntent, ResolutionType,
    StoreType, TrustBoundary,
};

/// Routing policy over the reasoning engines
pub struct MemoryRouter {
    conflicts: ConflictEngine,
    resolutions: ResolutionEngine,
    trust_boundary: TrustBoundary,
}

impl MemoryRouter {
    /// Build a router bound to the conflict and resolution engines
    pub fn new(
        conflicts: ConflictEngine,
        resolutions: ResolutionEngine,
        trust_boundary: TrustBoundary,
    ) -> Self {
        Self {
            conflicts,
            resolutions,
            trust_boundary,
        }
    }

    /// Route an event, enforcing the conflict-resolution invariant.
    pub fn route(
        &self,
        event: &MemoryEvent,
        intent: Option<&ResolutionIntent>,
        namespace: &str,
    ) -> Result<MemoryDecision> {
        if self.trust_boundary == TrustBoundary::HumanOnly
            && event.source == EventSource::Agent
            && event.kind == EventKind::Decision
        {
            return Ok(MemoryDecision::rejected("Trust Boundary Violation"));
        }

        if event.kind == EventKind::Decision {
            let conflicts = self.conflicts.get_conflict_files(event, namespace)?;
            if !conflicts.is_empty() {
                let target = event.context.target().unwrap_or_default();
                let Some(intent) = intent else {
                    return Ok(MemoryDecision::rejected(format!(
                        "CONFLICT: Active decisions for target '{target}' exist: {conflicts:?}. ResolutionIntent required."
                    )));
                };
                if !self.resolutions.validate_intent(intent, &conflicts) {
                    return Ok(MemoryDecision::rejected(format!(
                        "CONFLICT: Provided ResolutionIntent is invalid or does not cover all conflicts: {conflicts:?}."
                    )));
                }
            }
        }

        let store_type = if event.kind.is_semantic()
            || intent.is_some_and(|i| i.resolution_type == ResolutionType::Supersede)
        {
            StoreType::Semantic
        } else {
            StoreType::Episodic
        };
        let store_name = match store_type {
            StoreType::Semantic => "semantic",
            StoreType::Episodic => "episodic",
            StoreType::None => "none",
        };

        Ok(MemoryDecision::accepted(
            store_type,
            format!("Accepted {} for {store_name} storage", event.kind),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EventContext;
    use crate::storage::SemanticMetaStore;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn router(trust: TrustBoundary) -> (TempDir, MemoryRouter, Arc<SemanticMetaStore>) {
        let dir = TempDir::new().unwrap();
        let meta = Arc::new(SemanticMetaStore::open(dir.path().join("meta.db")).unwrap());
        let router = MemoryRouter::new(
            ConflictEngine::new(meta.clone()),
            ResolutionEngine::new(),
            trust,
        );
        (dir, router, meta)
    }

    fn decision(source: EventSource, target: &str) -> MemoryEvent {
        MemoryEvent::new(
            source,
            EventKind::Decision,
            "decide something",
            Some(EventContext::Map(json!({
                "title": "T", "target": target, "rationale": "A reasonable rationale."
            }))),
        )
        .unwrap()
    }

    fn active_row(meta: &SemanticMetaStore, fid: &str, target: &str) {
        meta.upsert(&crate::storage::MetaRow {
            fid: fid.into(),
            target: target.into(),
            title: "T".into(),
            status: "active".into(),
            kind: "decision".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            superseded_by: None,
            content: String::new(),
            keywords: String::new(),
            confidence: 1.0,
            namespace: "default".into(),
            hit_count: 0,
            last_hit_at: None,
            context_json: "{}".into(),
            phase: "pattern".into(),
            vitality: "active".into(),
            reinforcement_density: 0.0,
            stability_score: 0.0,
            coverage: 0.0,
        })
        .unwrap();
    }

    #[test]
    fn test_routes_semantic_kinds_to_semantic() {
        let (_dir, router, _meta) = router(TrustBoundary::AgentWithIntent);
        let ev = decision(EventSource::Agent, "style");
        let decision = router.route(&ev, None, "default").unwrap();
        assert!(decision.should_persist);
        assert_eq!(decision.store_type, StoreType::Semantic);
    }

    #[test]
    fn test_routes_episodic_kinds_to_episodic() {
        let (_dir, router, _meta) = router(TrustBoundary::AgentWithIntent);
        let ev = MemoryEvent::new(EventSource::Agent, EventKind::Result, "done", None).unwrap();
        let decision = router.route(&ev, None, "default").unwrap();
        assert!(decision.should_persist);
        assert_eq!(decision.store_type, StoreType::Episodic);
    }

    #[test]
    fn test_conflict_without_intent_rejected() {
        let (_dir, router, meta) = router(TrustBoundary::AgentWithIntent);
        active_row(&meta, "old.md", "style");
        let ev = decision(EventSource::Agent, "style");

        let decision = router.route(&ev, None, "default").unwrap();
        assert!(!decision.should_persist);
        assert!(decision.reason.contains("CONFLICT"));
        assert!(decision.reason.contains("ResolutionIntent required"));
    }

    #[test]
    fn test_conflict_with_covering_intent_accepted() {
        let (_dir, router, meta) = router(TrustBoundary::AgentWithIntent);
        active_row(&meta, "old.md", "style");
        let ev = decision(EventSource::Agent, "style");
        let intent = ResolutionIntent::new(
            ResolutionType::Supersede,
            "replacing the old style decision",
            vec!["old.md".into()],
        )
        .unwrap();

        let decision = router.route(&ev, Some(&intent), "default").unwrap();
        assert!(decision.should_persist);
        assert_eq!(decision.store_type, StoreType::Semantic);
    }

    #[test]
    fn test_conflict_with_partial_intent_rejected() {
        let (_dir, router, meta) = router(TrustBoundary::AgentWithIntent);
        active_row(&meta, "old.md", "style");
        let ev = decision(EventSource::Agent, "style");
        let intent = ResolutionIntent::new(
            ResolutionType::Supersede,
            "replacing something unrelated",
            vec!["other.md".into()],
        )
        .unwrap();

        let decision = router.route(&ev, Some(&intent), "default").unwrap();
        assert!(!decision.should_persist);
        assert!(decision.reason.contains("does not cover"));
    }

    #[test]
    fn test_human_only_blocks_agent_decisions() {
        let (_dir, router, _meta) = router(TrustBoundary::HumanOnly);
        let ev = decision(EventSource::Agent, "style");
        let decision = router.route(&ev, None, "default").unwrap();
        assert!(!decision.should_persist);
        assert_eq!(decision.reason, "Trust Boundary Violation");

        // User-originated decisions still pass
        let ev = decision(EventSource::User, "style");
        assert!(router.route(&ev, None, "default").unwrap().should_persist);
    }

    #[test]
    fn test_supersede_intent_forces_semantic() {
        let (_dir, router, _meta) = router(TrustBoundary::AgentWithIntent);
        let ev = MemoryEvent::new(EventSource::Agent, EventKind::Result, "done", None).unwrap();
        let intent = ResolutionIntent::new(
            ResolutionType::Supersede,
            "supersede on an episodic kind",
            vec!["old.md".into()],
        )
        .unwrap();
        let decision = router.route(&ev, Some(&intent), "default").unwrap();
        assert_eq!(decision.store_type, StoreType::Semantic);
    }
}
