//! Exponentially-weighted moving average updates for metrics rows

use chrono::{DateTime, Utc};

use super::types::{MetricsKey, MetricsRow, Outcome, observed};

/// Default smoothing factor applied to each new observation
pub const DEFAULT_SMOOTHING: f64 = 0.2;

fn smooth(lambda: f64, observation: f64, previous: f64) -> f64 {
    lambda * observation + (1.0 - lambda) * previous
}

/// Fold one outcome into a row's EWMA fields
///
/// The first observation seeds every field directly. The posterior, if any,
/// is carried over untouched.
pub fn apply_ewma(
    existing: Option<&MetricsRow>,
    key: &MetricsKey,
    outcome: &Outcome,
    now: DateTime<Utc>,
    lambda: f64,
) -> MetricsRow {
    let lambda = if lambda.is_finite() {
        lambda.clamp(0.0, 1.0)
    } else {
        DEFAULT_SMOOTHING
    };
    let success = if outcome.success { 1.0 } else { 0.0 };
    let call_cost = outcome.cost_usd.unwrap_or(outcome.cost_per_1k);
    let posterior = existing.and_then(|r| r.posterior);

    match observed(existing) {
        None => MetricsRow {
            key: key.clone(),
            ewma_latency_ms: outcome.latency_ms,
            ewma_quality: outcome.quality_avg,
            ewma_cost_per_1k: outcome.cost_per_1k,
            ewma_success_rate: success,
            sample_count: 1,
            cost_ewma: call_cost,
            last_call_at: Some(now),
            posterior,
        },
        Some(row) => MetricsRow {
            key: key.clone(),
            ewma_latency_ms: smooth(lambda, outcome.latency_ms, row.ewma_latency_ms),
            ewma_quality: smooth(lambda, outcome.quality_avg, row.ewma_quality),
            ewma_cost_per_1k: smooth(lambda, outcome.cost_per_1k, row.ewma_cost_per_1k),
            ewma_success_rate: smooth(lambda, success, row.ewma_success_rate),
            sample_count: row.sample_count + 1,
            cost_ewma: smooth(lambda, call_cost, row.cost_ewma),
            last_call_at: Some(now),
            posterior,
        },
    }
}
