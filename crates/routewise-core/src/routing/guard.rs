//! Score guards: SLA penalties, confidence decay, batch normalization, and
//! the diversity guard against provider monopolization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{PenaltyRow, Provider, UsageRow};

/// Latency normalization floor in milliseconds
pub const LATENCY_FLOOR_MS: f64 = 1.0;
/// Cost normalization floor
pub const COST_FLOOR: f64 = 0.0001;

/// Guard parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLayer {
    /// Usage share (percent) above which a provider counts as dominant
    pub diversity_threshold_pct: f64,
    /// Minimum exploration rate while a provider is dominant
    pub diversity_epsilon_floor: f64,
    /// E-folding time of confidence decay, in days
    pub decay_days: f64,
    /// Sample count at which sample confidence saturates
    pub confidence_sample_cap: u64,
}

impl Default for GuardLayer {
    fn default() -> Self {
        Self {
            diversity_threshold_pct: 95.0,
            diversity_epsilon_floor: 0.15,
            decay_days: 30.0,
            confidence_sample_cap: 100,
        }
    }
}

/// Outcome of the diversity scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityCheck {
    pub epsilon: f64,
    pub triggered: bool,
}

/// Batch-relative latency and cost scores, 1.0 best
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelativeScores {
    pub latency: Vec<f64>,
    pub cost: Vec<f64>,
}

impl GuardLayer {
    fn days_since(last_call_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let millis = (now - last_call_at).num_milliseconds().max(0) as f64;
        millis / 86_400_000.0
    }

    fn recency(&self, last_call_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let decay_days = if self.decay_days > 0.0 {
            self.decay_days
        } else {
            30.0
        };
        (-Self::days_since(last_call_at, now) / decay_days).exp()
    }

    /// Confidence in a candidate's statistics from volume and recency
    pub fn confidence_score(
        &self,
        sample_count: u64,
        last_call_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64 {
        let cap = self.confidence_sample_cap.max(1) as f64;
        let sample_factor = (sample_count as f64 / cap).min(1.0);
        match last_call_at {
            None => sample_factor * 0.5,
            Some(at) => sample_factor * self.recency(at, now),
        }
    }

    /// Multiplier that fades stale statistics; `0.5` when never observed
    pub fn decay_factor(&self, last_call_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        match last_call_at {
            None => 0.5,
            Some(at) => self.recency(at, now),
        }
    }

    /// Strongest active penalty for a provider, `1.0` when none applies
    pub fn penalty_multiplier(
        &self,
        penalties: &[PenaltyRow],
        provider: &Provider,
        feature: &str,
        now: DateTime<Utc>,
    ) -> f64 {
        penalties
            .iter()
            .filter(|p| &p.provider == provider && p.feature == feature && p.is_active(now))
            .map(|p| p.penalty_multiplier.clamp(f64::MIN_POSITIVE, 1.0))
            .fold(1.0, f64::min)
    }

    /// Raise epsilon when one provider holds more than the threshold share
    pub fn diversity_guard(&self, epsilon: f64, usage: &[UsageRow]) -> DiversityCheck {
        let dominant = usage
            .iter()
            .find(|u| u.usage_percentage > self.diversity_threshold_pct);
        match dominant {
            Some(row) => {
                tracing::debug!(
                    provider = %row.provider,
                    share = row.usage_percentage,
                    "Diversity guard triggered"
                );
                DiversityCheck {
                    epsilon: epsilon.max(self.diversity_epsilon_floor),
                    triggered: true,
                }
            }
            None => DiversityCheck {
                epsilon,
                triggered: false,
            },
        }
    }

    /// Reject out-of-range parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.diversity_threshold_pct) {
            return Err("guard.diversity_threshold_pct must be between 0 and 100".to_string());
        }
        if !(0.0..=1.0).contains(&self.diversity_epsilon_floor) {
            return Err("guard.diversity_epsilon_floor must be between 0 and 1".to_string());
        }
        if !self.decay_days.is_finite() || self.decay_days <= 0.0 {
            return Err("guard.decay_days must be positive".to_string());
        }
        Ok(())
    }
}

/// Normalize latency and cost across a batch
///
/// Each input is `(latency_ms, cost)`. Negative values count as zero.
pub fn relative_scores(values: &[(f64, f64)]) -> RelativeScores {
    if values.is_empty() {
        return RelativeScores::default();
    }
    let clean = |v: f64| if v.is_finite() { v.max(0.0) } else { 0.0 };
    let max_latency = values
        .iter()
        .map(|(l, _)| clean(*l))
        .fold(LATENCY_FLOOR_MS, f64::max);
    let max_cost = values
        .iter()
        .map(|(_, c)| clean(*c))
        .fold(COST_FLOOR, f64::max);

    RelativeScores {
        latency: values
            .iter()
            .map(|(l, _)| clamp01(1.0 - clean(*l) / max_latency))
            .collect(),
        cost: values
            .iter()
            .map(|(_, c)| clamp01(1.0 - clean(*c) / max_cost))
            .collect(),
    }
}

pub(crate) fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
