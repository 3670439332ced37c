//! Lifecycle engine - temporal signals and phase promotion for decision
//! streams.
//!
//! Streams crystallize pattern -> emergent -> canonical as reinforcement
//! accumulates, and lose vitality (and confidence) with inactivity.

use chrono::{DateTime, Utc};

use crate::schema::{DecisionPhase, DecisionStream, DecisionVitality, PatternScope};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Computes phase, vitality, and stability for decision streams
pub struct LifecycleEngine {
    observation_window_days: f64,
}

impl Default for LifecycleEngine {
    fn default() -> Self {
        Self::new(30.0)
    }
}

impl LifecycleEngine {
    /// Build an engine with the given observation window
    pub fn new(observation_window_days: f64) -> Self {
        Self {
            observation_window_days,
        }
    }

    /// Update lifetime, density, coverage, and stability from the
    /// reinforcement history.
    pub fn calculate_temporal_signals(
        &self,
        stream: &mut DecisionStream,
        reinforcement_dates: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) {
        if reinforcement_dates.is_empty() {
            stream.lifetime_days = (now - stream.first_seen).num_seconds() as f64 / SECONDS_PER_DAY;
            stream.reinforcement_density = 0.0;
            stream.stability_score = 0.0;
            stream.coverage = stream.lifetime_days / self.observation_window_days;
            return;
        }

        let mut sorted = reinforcement_dates.to_vec();
        sorted.sort();
        if stream.first_seen > sorted[0] {
            stream.first_seen = sorted[0];
        }
        stream.last_seen = *sorted.last().expect("nonempty");

        stream.lifetime_days =
            (stream.last_seen - stream.first_seen).num_seconds() as f64 / SECONDS_PER_DAY;
        let safe_lifetime = stream.lifetime_days.max(0.01);

        stream.frequency = sorted.len() as i64;
        stream.reinforcement_density = stream.frequency as f64 / safe_lifetime;
        stream.coverage = stream.lifetime_days / self.observation_window_days;

        stream.stability_score = match sorted.len() {
            0 | 1 => 0.0,
            2 => 0.3,
            _ => {
                let intervals: Vec<f64> = sorted
                    .windows(2)
                    .map(|w| (w[1] - w[0]).num_seconds() as f64 / SECONDS_PER_DAY)
                    .collect();
                let variance = sample_variance(&intervals);
                (1.0 - variance / (safe_lifetime + 1.0)).max(0.0)
            }
        };
    }

    /// Weighted cost of removing this knowledge, in [0, 1]
    pub fn estimate_removal_cost(&self, stream: &DecisionStream) -> f64 {
        let mut score = match stream.scope {
            PatternScope::Infra => 0.5,
            PatternScope::System => 0.3,
            PatternScope::Local => 0.0,
        };
        score += (stream.consequences.len() as f64 * 0.05).min(0.2);
        score += (stream.unique_contexts as f64 * 0.05).min(0.3);
        if stream.provenance == "external" {
            score += 0.4;
        }
        score += (stream.hit_count as f64 / 100.0).min(0.2);
        score += stream.confidence * 0.1;
        score.min(1.0)
    }

    /// Estimated usefulness, in [0, 1]
    pub fn estimate_utility(&self, stream: &DecisionStream) -> f64 {
        let mut score = (stream.frequency as f64 / 10.0).min(0.4);
        score += (stream.unique_contexts as f64 / 5.0).min(0.3);
        if matches!(stream.scope, PatternScope::System | PatternScope::Infra) {
            score += 0.2;
        }
        score.min(1.0)
    }

    /// Update vitality: active under a week, decaying under a month
    /// (confidence -0.05), dormant beyond (confidence -0.2).
    pub fn update_vitality(&self, stream: &mut DecisionStream, now: DateTime<Utc>) {
        let days_since_last = (now - stream.last_seen).num_seconds() as f64 / SECONDS_PER_DAY;
        if days_since_last < 7.0 {
            stream.vitality = DecisionVitality::Active;
        } else if days_since_last < 30.0 {
            stream.vitality = DecisionVitality::Decaying;
            stream.confidence = (stream.confidence - 0.05).max(0.0);
        } else {
            stream.vitality = DecisionVitality::Dormant;
            stream.confidence = (stream.confidence - 0.2).max(0.0);
        }
    }

    /// Evaluate phase transitions and refresh cost/utility/confidence.
    ///
    /// Confidence blends toward the calculated value with momentum 0.5,
    /// where calculated = 0.4*utility + 0.3*removal_cost + 0.3*stability.
    pub fn promote_stream(&self, stream: &mut DecisionStream) {
        let old_phase = stream.phase;

        stream.estimated_removal_cost = self.estimate_removal_cost(stream);
        stream.estimated_utility = self.estimate_utility(stream);

        let calculated = 0.4 * stream.estimated_utility
            + 0.3 * stream.estimated_removal_cost
            + 0.3 * stream.stability_score;
        let momentum = 0.5;
        stream.confidence = stream.confidence * (1.0 - momentum) + calculated * momentum;

        match stream.phase {
            DecisionPhase::Pattern => {
                let has_signal = stream.frequency >= 3
                    || stream.estimated_removal_cost >= 0.4
                    || stream.confidence >= 0.5;
                let has_history = stream.lifetime_days > 0.5
                    || stream.frequency >= 5
                    || stream.provenance == "external"
                    || stream.estimated_removal_cost >= 0.5;
                if has_signal && has_history {
                    stream.phase = DecisionPhase::Emergent;
                }
            }
            DecisionPhase::Emergent => {
                // Canonical is strict to prevent burst crystallization
                if stream.coverage > 0.3
                    && stream.stability_score > 0.6
                    && stream.estimated_removal_cost > 0.5
                    && stream.vitality == DecisionVitality::Active
                {
                    stream.phase = DecisionPhase::Canonical;
                }
            }
            DecisionPhase::Canonical => {}
        }

        if stream.phase != old_phase {
            tracing::info!(
                target_key = %stream.target,
                from = old_phase.as_str(),
                to = stream.phase.as_str(),
                "stream promoted"
            );
        }
    }

    /// Special path for manual interventions: system scope, high removal
    /// cost, straight to emergent.
    pub fn process_intervention(&self, stream: &mut DecisionStream, now: DateTime<Utc>) {
        stream.scope = PatternScope::System;
        stream.first_seen = now;
        stream.last_seen = now;
        stream.estimated_removal_cost = 0.8;
        stream.estimated_utility = 0.5;
        stream.phase = DecisionPhase::Emergent;
        stream.vitality = DecisionVitality::Active;
        stream.confidence = 0.7;
    }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}
