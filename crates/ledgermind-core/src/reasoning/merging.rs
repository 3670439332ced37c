//! Merge engine - detects semantically identical decisions and proposes
//! consolidating them.

use crate::error::Result;
use crate::memory::{Memory, SearchMode};
use crate::schema::{EventContext, EventKind, EventSource, ProposalContext};

/// Similarity score above which two active decisions count as duplicates
pub const MERGE_THRESHOLD: f32 = 0.85;

/// How many recent decisions each scan inspects
const SCAN_WINDOW: usize = 20;

/// Scans for duplicate knowledge and emits merge proposals
pub struct MergeEngine<'a> {
    memory: &'a Memory,
}

impl<'a> MergeEngine<'a> {
    /// Build an engine over the facade
    pub fn new(memory: &'a Memory) -> Self {
        Self { memory }
    }

    /// Scan recent decisions for strict-mode duplicates and create one
    /// merge proposal per cluster found. Returns created proposal ids.
    pub fn scan_for_duplicates(&self, threshold: f32) -> Result<Vec<String>> {
        let active_ids = self.memory.get_decisions()?;
        let mut proposals = Vec::new();

        for fid in active_ids.iter().take(SCAN_WINDOW) {
            let Ok((doc, _body)) = self.memory.semantic().load_artifact(fid) else {
                continue;
            };
            let content = if doc.content.is_empty() {
                doc.context_str("title").unwrap_or_default().to_string()
            } else {
                doc.content.clone()
            };
            if content.is_empty() {
                continue;
            }

            let results =
                match self.memory.search_decisions(&content, 5, 0, None, SearchMode::Strict) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(fid = %fid, "error scanning for duplicates: {e}");
                        continue;
                    }
                };

            let duplicates: Vec<String> = results
                .into_iter()
                .filter(|r| r.id != *fid && r.score >= threshold)
                .map(|r| r.id)
                .collect();

            if !duplicates.is_empty() {
                let mut targets = duplicates;
                targets.push(fid.clone());
                if let Some(id) = self.create_merge_proposal(targets, &content)? {
                    proposals.push(id);
                }
            }
        }
        Ok(proposals)
    }

    fn create_merge_proposal(
        &self,
        mut target_ids: Vec<String>,
        topic: &str,
    ) -> Result<Option<String>> {
        target_ids.sort();
        target_ids.dedup();
        if target_ids.len() < 2 {
            return Ok(None);
        }

        let short_topic: String = topic.chars().take(30).collect();
        let title = format!("Merge Duplicates: {short_topic}...");
        let mut ctx = ProposalContext::new(
            &title,
            "knowledge_merge",
            format!(
                "Detected {} semantically identical decisions. Suggesting merge to reduce fragmentation.",
                target_ids.len()
            ),
            0.99,
        );
        ctx.suggested_supersedes = target_ids;
        ctx.strengths = vec![
            "Reduces redundancy".to_string(),
            "Improves retrieval precision".to_string(),
        ];
        ctx.suggested_consequences = vec!["Original decisions will be superseded".to_string()];

        match self.memory.process_event(
            EventSource::System,
            EventKind::Proposal,
            &title,
            Some(EventContext::Proposal(Box::new(ctx))),
            None,
            None,
        ) {
            Ok(decision) => Ok(decision.file_id().map(String::from)),
            Err(e) => {
                tracing::error!("failed to create merge proposal: {e}");
                Ok(None)
            }
        }
    }
}
