//! Hybrid ranked retrieval over the semantic store.
//!
//! Vector and keyword rankings fuse with RRF, every candidate resolves
//! through its supersede chain to the current truth, and the fused score
//! is reweighted by evidence links, status, and lifecycle signals before
//! namespace filtering, deduplication, and pagination.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::Memory;
use crate::schema::{ArtifactStatus, DecisionPhase, DecisionVitality};
use crate::search::{reciprocal_rank_fusion, rrf_max, RRF_K};
use crate::storage::MetaRow;

/// How strictly search treats non-active knowledge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Only active heads are returned
    Strict,
    /// Chains resolve to their head; non-active survivors are downweighted
    #[default]
    Balanced,
    /// No resolution: every matching record is visible
    Audit,
}

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Artifact id (after truth resolution)
    pub id: String,
    /// Final score after all multipliers
    pub score: f32,
    /// Artifact status
    pub status: String,
    /// Short human title
    pub title: String,
    /// Normalized subject key
    pub target: String,
    /// Cached content
    pub content: String,
    /// Rationale, when recorded
    pub rationale: Option<String>,
    /// Consequences, when recorded
    pub consequences: Option<Vec<String>>,
    /// Producing event kind
    pub kind: String,
    /// Whether the record is the active truth
    pub is_active: bool,
    /// Count of episodic events grounding this record
    pub evidence_count: i64,
}

impl Memory {
    /// Search decisions with recursive truth resolution and hybrid
    /// vector/keyword ranking.
    pub fn search_decisions(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
        namespace: Option<&str>,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        let effective_namespace = namespace.unwrap_or(self.namespace());

        // Namespace filtering happens after fusion, so over-fetch
        // aggressively when one is requested to avoid starvation
        let search_limit = if namespace.is_some() {
            ((offset + limit) * 10).max(200)
        } else {
            (offset + limit) * 3
        };

        let vector_hits: Vec<(String, f32)> = {
            let mut vector = self.vector().lock().unwrap_or_else(|p| p.into_inner());
            vector
                .search(query, search_limit)
                .into_iter()
                .map(|h| (h.id, h.score))
                .collect()
        };
        let keyword_hits: Vec<(String, f32)> = self
            .semantic()
            .meta
            .keyword_search(query, search_limit, effective_namespace)?
            .into_iter()
            .map(|m| (m.fid, 1.0))
            .collect();

        let fused = reciprocal_rank_fusion(&vector_hits, &keyword_hits, RRF_K);
        let max_rrf = rrf_max(RRF_K);

        let mut candidates: Vec<SearchResult> = Vec::new();
        for (fid, rrf_score) in &fused {
            let Some(meta) = self
                .semantic()
                .meta
                .resolve_to_truth(fid, mode == SearchMode::Audit)?
            else {
                continue;
            };

            if meta.namespace != effective_namespace {
                continue;
            }
            if mode == SearchMode::Strict && meta.status != "active" {
                continue;
            }

            let (link_count, _strength) = self
                .episodic()
                .count_links_for_semantic(&meta.fid)?;

            let score = Self::rescore(rrf_score / max_rrf, link_count, &meta);
            candidates.push(Self::result_from(meta, score, link_count));
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Outside audit mode, one result per target; actives displace
        // resolved-but-inactive survivors
        let deduped: Vec<SearchResult> = if mode == SearchMode::Audit {
            candidates
        } else {
            let mut kept: Vec<SearchResult> = Vec::new();
            for cand in candidates {
                match kept.iter_mut().find(|k| k.target == cand.target) {
                    None => kept.push(cand),
                    Some(existing) if !existing.is_active && cand.is_active => *existing = cand,
                    Some(_) => {}
                }
            }
            kept
        };

        let mut final_results = Vec::with_capacity(limit);
        let mut seen_ids = std::collections::HashSet::new();
        let mut skipped = 0usize;
        for cand in deduped {
            if !seen_ids.insert(cand.id.clone()) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if let Err(e) = self.semantic().meta.increment_hit(&cand.id) {
                // Non-fatal: search proceeds even if the counter is busy
                tracing::debug!(fid = %cand.id, "failed to increment hit count: {e}");
            }
            final_results.push(cand);
            if final_results.len() >= limit {
                break;
            }
        }
        Ok(final_results)
    }

    /// Apply evidence, status, and lifecycle multipliers to a normalized
    /// RRF score.
    fn rescore(normalized_rrf: f32, link_count: i64, meta: &MetaRow) -> f32 {
        let evidence_boost = 1.0 + (link_count as f32 * 0.2).min(1.0);
        let status_multiplier = ArtifactStatus::search_multiplier(&meta.status);
        let phase_weight = DecisionPhase::parse_name(&meta.phase).weight();
        let vitality_weight = DecisionVitality::parse_name(&meta.vitality).weight();
        normalized_rrf * evidence_boost * status_multiplier * phase_weight * vitality_weight
    }

    fn result_from(meta: MetaRow, score: f32, evidence_count: i64) -> SearchResult {
        let ctx = meta.context();
        SearchResult {
            score,
            status: meta.status.clone(),
            is_active: meta.status == "active",
            title: meta.title.clone(),
            target: meta.target.clone(),
            content: meta.content.clone(),
            rationale: ctx
                .get("rationale")
                .and_then(|v| v.as_str())
                .map(String::from),
            consequences: ctx.get("consequences").and_then(|v| v.as_array()).map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            }),
            kind: meta.kind,
            evidence_count,
            id: meta.fid,
        }
    }
}
