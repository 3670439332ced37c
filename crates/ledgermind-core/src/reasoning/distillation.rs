//! Trajectory distillation - turning successful event chains into
//! procedural proposals.
//!
//! Scans for RESULT events marking success and folds the window of events
//! leading up to each into an ordered procedure, inheriting the target
//! from the result or the most recent event in the trajectory that has
//! one.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;

use crate::error::Result;
use crate::schema::{ProceduralContent, ProceduralStep, ProposalContext, ProposalStatus};
use crate::storage::{EpisodicEvent, EpisodicStore};

/// Event kinds that contribute steps to a distilled procedure
const STEP_KINDS: [&str; 6] = ["task", "call", "decision", "commit_change", "prompt", "result"];

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]{3,}").expect("static regex"))
}

/// Distills procedural knowledge from episodic trajectories
pub struct DistillationEngine<'a> {
    episodic: &'a EpisodicStore,
    window_size: usize,
}

impl<'a> DistillationEngine<'a> {
    /// Build an engine with the default window of 5 events
    pub fn new(episodic: &'a EpisodicStore) -> Self {
        Self {
            episodic,
            window_size: 5,
        }
    }

    /// Simple keyword extraction from title, target, and rationale
    pub fn extract_keywords(title: &str, target: &str, rationale: &str) -> Vec<String> {
        const STOP_WORDS: [&str; 12] = [
            "for", "the", "and", "with", "from", "this", "that", "was", "were", "been", "has",
            "had",
        ];
        let text = format!("{title} {target} {rationale}").to_lowercase();
        let unique: BTreeSet<String> = keyword_re()
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
            .collect();
        unique.into_iter().take(10).collect()
    }

    /// Find successful trajectories after the watermark and turn each into
    /// a procedural proposal.
    pub fn distill_trajectories(
        &self,
        limit: usize,
        after_id: Option<i64>,
    ) -> Result<Vec<ProposalContext>> {
        let ascending = after_id.is_some();
        let events = self.episodic.query(limit, Some("active"), after_id, ascending)?;
        if events.is_empty() {
            return Ok(vec![]);
        }
        // Chronological order regardless of how we fetched
        let chronological: Vec<EpisodicEvent> = if ascending {
            events
        } else {
            events.into_iter().rev().collect()
        };

        let mut proposals = Vec::new();
        for (i, event) in chronological.iter().enumerate() {
            if event.kind != "result" {
                continue;
            }
            let success = event
                .context
                .get("success")
                .map(success_score)
                .unwrap_or_else(|| event.content.to_lowercase().contains("success"));
            if !success {
                continue;
            }
            let window_start = i.saturating_sub(self.window_size);
            let trajectory = &chronological[window_start..i];
            if !trajectory.is_empty() {
                proposals.push(self.create_procedural_proposal(trajectory, event));
            }
        }
        Ok(proposals)
    }

    /// Build a proposal from one trajectory ending in a successful result.
    pub fn create_procedural_proposal(
        &self,
        trajectory: &[EpisodicEvent],
        result_event: &EpisodicEvent,
    ) -> ProposalContext {
        let mut steps = Vec::new();
        let mut evidence_ids = Vec::new();

        for ev in trajectory {
            if !STEP_KINDS.contains(&ev.kind.as_str()) {
                continue;
            }
            let content = clean_content(&ev.content);
            if content.len() < 5 {
                continue;
            }

            let changed_files: Vec<String> = ev
                .context
                .get("changed_files")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|f| f.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            let rationale = ev
                .context_str("rationale")
                .or_else(|| ev.context_str("full_message"))
                .map(String::from)
                .unwrap_or_else(|| match ev.kind.as_str() {
                    "prompt" => format!("User initiative: {}...", truncate(&content, 100)),
                    "result" => "System response/outcome of action".to_string(),
                    "commit_change" => {
                        let mut r = truncate(&content, 150);
                        if !changed_files.is_empty() {
                            let mut file_str = changed_files
                                .iter()
                                .take(5)
                                .cloned()
                                .collect::<Vec<_>>()
                                .join(", ");
                            if changed_files.len() > 5 {
                                file_str.push_str(&format!(" (+{} more)", changed_files.len() - 5));
                            }
                            r.push_str(&format!(" | Changes: {file_str}"));
                        }
                        r
                    }
                    kind => format!("Recorded {kind} event"),
                });

            let action = if ev.kind == "commit_change" {
                let hash = ev.context_str("hash").unwrap_or("unknown");
                let short = &hash[..hash.len().min(8)];
                if changed_files.is_empty() {
                    format!("[COMMIT_CHANGE] {short}: {}...", truncate(&content, 150))
                } else {
                    let files = changed_files
                        .iter()
                        .take(3)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(
                        "[COMMIT_CHANGE] {short}: {}... (Files: {files})",
                        truncate(&content, 150)
                    )
                }
            } else {
                format!(
                    "[{}] {}...",
                    ev.kind.to_uppercase(),
                    truncate(&content, 200)
                )
            };

            steps.push(ProceduralStep {
                action,
                rationale: Some(rationale),
                expected_outcome: None,
            });
            evidence_ids.push(ev.id);
        }

        // Target inheritance: result first, then walk the trajectory back
        let mut target = result_event
            .context_str("target")
            .filter(|t| *t != "unknown")
            .map(String::from);
        if target.is_none() {
            for ev in trajectory.iter().rev() {
                if let Some(candidate) = ev.context_str("target").filter(|t| *t != "unknown") {
                    target = Some(candidate.to_string());
                    break;
                }
            }
        }
        let target = target.unwrap_or_else(|| "unknown".to_string());

        evidence_ids.push(result_event.id);

        let procedural = ProceduralContent {
            steps,
            target_task: target.clone(),
            success_evidence_ids: evidence_ids.clone(),
        };

        let title = format!("Procedural Optimization for {target}");
        let rationale = format!(
            "Distilled from successful trajectory ending in event {}",
            result_event.id
        );
        let keywords = Self::extract_keywords(&title, &target, &rationale);

        let mut proposal = ProposalContext::new(&title, &target, &rationale, 0.8);
        proposal.status = ProposalStatus::Draft;
        proposal.keywords = keywords;
        proposal.evidence_event_ids = evidence_ids;
        proposal.procedural = Some(procedural);
        proposal.first_observed_at = Utc::now();
        proposal
    }
}

/// Unwrap JSON-wrapped prompt payloads down to the message itself
fn clean_content(content: &str) -> String {
    if content.trim_start().starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
            if let Some(inner) = value
                .get("prompt")
                .or_else(|| value.get("prompt_response"))
                .and_then(|v| v.as_str())
            {
                return inner.to_string();
            }
        }
    }
    content.to_string()
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn success_score(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0) >= 0.5,
        _ => false,
    }
}
