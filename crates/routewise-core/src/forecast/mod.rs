//! Cost and SLA forecasting
//!
//! Pure functions over daily aggregates: burn rate and monthly projection,
//! exponential smoothing, latency drift and error-rate trend, risk levels,
//! and the adjustments fed back into the rankers. The batch job that builds
//! the aggregates lives in [`aggregation`].

pub mod aggregation;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::routing::guard::clamp01;
use crate::routing::types::{BudgetConfig, ForecastHints, Provider};
use crate::routing::weights::CostAwareWeights;

pub use aggregation::{AggregationReport, DailyAggregator, StageReport};

/// Trailing window used for the burn rate
pub const DEFAULT_BURN_WINDOW_DAYS: usize = 7;
/// Days in a projected month
pub const DAYS_PER_MONTH: f64 = 30.0;
/// Default exponential smoothing factor
pub const DEFAULT_SMOOTHING_ALPHA: f64 = 0.3;

/// Latency drift at which the drift score saturates
const LATENCY_DRIFT_SCALE: f64 = 0.30;
/// Error-rate trend at which the drift score saturates
const ERROR_TREND_SCALE: f64 = 0.10;
/// Drift score above which Thompson shapes are decayed
pub const EXPLORATION_DRIFT_THRESHOLD: f64 = 0.5;
/// Shape decay applied when exploration is boosted
pub const EXPLORATION_SHAPE_DECAY: f64 = 0.9;

/// Three-level risk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(Error::InvalidInput(format!("unknown risk level '{}'", s))),
        }
    }
}

/// Average daily spend and its monthly projection
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BurnRate {
    pub burn_rate: f64,
    pub projected_monthly_cost: f64,
}

/// Burn rate over the default trailing window
pub fn compute_burn_rate(daily_costs: &[f64]) -> BurnRate {
    burn_rate_over(daily_costs, DEFAULT_BURN_WINDOW_DAYS)
}

/// Burn rate over the last `window` values (fewer if history is shorter)
pub fn burn_rate_over(daily_costs: &[f64], window: usize) -> BurnRate {
    let window = window.max(1).min(daily_costs.len());
    if window == 0 {
        return BurnRate::default();
    }
    let tail = &daily_costs[daily_costs.len() - window..];
    let burn_rate = tail.iter().sum::<f64>() / window as f64;
    BurnRate {
        burn_rate,
        projected_monthly_cost: burn_rate * DAYS_PER_MONTH,
    }
}

/// Recursive exponential smoothing seeded with the first value
///
/// Returns the final smoothed value, `0.0` for an empty series.
pub fn exponential_smoothing(values: &[f64], alpha: f64) -> f64 {
    let Some((first, rest)) = values.split_first() else {
        return 0.0;
    };
    let alpha = clamp01(alpha);
    rest.iter()
        .fold(*first, |smoothed, x| alpha * x + (1.0 - alpha) * smoothed)
}

pub fn compute_budget_risk(projected_monthly_cost: f64, monthly_budget: f64) -> RiskLevel {
    if monthly_budget <= 0.0 {
        return RiskLevel::Low;
    }
    let ratio = projected_monthly_cost / monthly_budget;
    if ratio > 0.9 {
        RiskLevel::High
    } else if ratio > 0.7 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Relative change in mean latency from `previous` to `current`
pub fn compute_latency_drift(current: &[f64], previous: &[f64]) -> f64 {
    match (mean(current), mean(previous)) {
        (Some(cur), Some(prev)) if prev > 0.0 => (cur - prev) / prev,
        _ => 0.0,
    }
}

/// Difference of mean error rates, `current - previous`
pub fn compute_error_rate_trend(current: &[f64], previous: &[f64]) -> f64 {
    match (mean(current), mean(previous)) {
        (Some(cur), Some(prev)) => cur - prev,
        _ => 0.0,
    }
}

pub fn compute_sla_risk_level(latency_drift: f64, error_trend: f64) -> RiskLevel {
    if latency_drift > 0.30 || error_trend > 0.10 {
        RiskLevel::High
    } else if latency_drift > 0.15 || error_trend > 0.05 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Smooth severity in `[0, 1]`; improvements contribute nothing
pub fn compute_performance_drift_score(latency_drift: f64, error_trend: f64) -> f64 {
    0.6 * clamp01(latency_drift / LATENCY_DRIFT_SCALE)
        + 0.4 * clamp01(error_trend / ERROR_TREND_SCALE)
}

/// Multipliers layered onto ranker weights and scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastAdjustments {
    pub cost_weight_multiplier: f64,
    pub provider_penalty: f64,
    pub exploration_boost: bool,
    pub ts_alpha_decay: f64,
    pub ts_beta_decay: f64,
}

impl Default for ForecastAdjustments {
    fn default() -> Self {
        Self {
            cost_weight_multiplier: 1.0,
            provider_penalty: 1.0,
            exploration_boost: false,
            ts_alpha_decay: 1.0,
            ts_beta_decay: 1.0,
        }
    }
}

pub fn compute_forecast_adjustments(
    budget_risk: RiskLevel,
    sla_risk: RiskLevel,
    drift_score: f64,
) -> ForecastAdjustments {
    let cost_weight_multiplier = match budget_risk {
        RiskLevel::High => 1.25,
        RiskLevel::Medium => 1.125,
        RiskLevel::Low => 1.0,
    };
    let provider_penalty = match sla_risk {
        RiskLevel::High => 0.8,
        RiskLevel::Medium => 0.9,
        RiskLevel::Low => 1.0,
    };
    let exploration_boost = drift_score > EXPLORATION_DRIFT_THRESHOLD;
    let decay = if exploration_boost {
        EXPLORATION_SHAPE_DECAY
    } else {
        1.0
    };
    ForecastAdjustments {
        cost_weight_multiplier,
        provider_penalty,
        exploration_boost,
        ts_alpha_decay: decay,
        ts_beta_decay: decay,
    }
}

/// Scale `w_cost` and renormalize all five weights
pub fn apply_forecast_cost_adjustment(weights: CostAwareWeights, multiplier: f64) -> CostAwareWeights {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return weights;
    }
    weights.with_cost_multiplier(multiplier)
}

/// Forecast per `(tenant, feature)`, replaced wholesale each aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastState {
    pub tenant_id: String,
    pub feature: String,
    pub projected_monthly_cost: f64,
    pub burn_rate: f64,
    /// Exponentially smoothed daily cost, projected monthly
    pub smoothed_monthly_cost: f64,
    pub sla_risk_level: RiskLevel,
    pub performance_drift_score: f64,
    /// Providers whose own SLA risk on this feature is medium or high
    pub degraded_providers: Vec<Provider>,
    pub last_updated: DateTime<Utc>,
}

impl ForecastState {
    /// Adjustments for a ranking call, judging budget risk against the tenant's budget
    pub fn adjustments(&self, budget: Option<&BudgetConfig>) -> ForecastAdjustments {
        let budget_risk = budget.map_or(RiskLevel::Low, |b| {
            compute_budget_risk(self.projected_monthly_cost, b.monthly_budget)
        });
        compute_forecast_adjustments(budget_risk, self.sla_risk_level, self.performance_drift_score)
    }

    pub fn hints(&self, budget: Option<&BudgetConfig>) -> ForecastHints {
        ForecastHints {
            adjustments: self.adjustments(budget),
            degraded_providers: self.degraded_providers.clone(),
        }
    }
}

/// Total spend of one `(tenant, feature, provider)` on one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCostRow {
    pub date: NaiveDate,
    pub tenant_id: String,
    pub feature: String,
    pub provider: Provider,
    pub total_cost_usd: f64,
    pub call_count: u64,
}

/// Performance of one `(provider, feature)` on one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPerformanceRow {
    pub date: NaiveDate,
    pub provider: Provider,
    pub feature: String,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub call_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::types::RoutingMode;

    #[test]
    fn test_burn_rate() {
        assert_eq!(compute_burn_rate(&[]), BurnRate::default());
        let rate = compute_burn_rate(&[10.0, 10.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        assert!((rate.burn_rate - 1.0).abs() < 1e-12);
        assert!((rate.projected_monthly_cost - 30.0).abs() < 1e-12);

        let short = compute_burn_rate(&[2.0, 4.0]);
        assert!((short.burn_rate - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_smoothing() {
        assert_eq!(exponential_smoothing(&[42.0], 0.3), 42.0);
        assert_eq!(exponential_smoothing(&[], 0.3), 0.0);
        let s = exponential_smoothing(&[10.0, 20.0], 0.3);
        assert!((s - 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_budget_risk() {
        assert_eq!(compute_budget_risk(500.0, 0.0), RiskLevel::Low);
        assert_eq!(compute_budget_risk(95.0, 100.0), RiskLevel::High);
        assert_eq!(compute_budget_risk(80.0, 100.0), RiskLevel::Medium);
        assert_eq!(compute_budget_risk(70.0, 100.0), RiskLevel::Low);
    }

    #[test]
    fn test_latency_drift_and_error_trend() {
        assert_eq!(compute_latency_drift(&[], &[100.0]), 0.0);
        assert_eq!(compute_latency_drift(&[100.0], &[0.0]), 0.0);
        assert!((compute_latency_drift(&[130.0, 130.0], &[100.0, 100.0]) - 0.3).abs() < 1e-12);
        assert!((compute_error_rate_trend(&[0.08], &[0.02]) - 0.06).abs() < 1e-12);
        assert_eq!(compute_error_rate_trend(&[0.08], &[]), 0.0);
    }

    #[test]
    fn test_sla_risk_level() {
        assert_eq!(compute_sla_risk_level(0.31, 0.0), RiskLevel::High);
        assert_eq!(compute_sla_risk_level(0.0, 0.11), RiskLevel::High);
        assert_eq!(compute_sla_risk_level(0.2, 0.0), RiskLevel::Medium);
        assert_eq!(compute_sla_risk_level(0.0, 0.06), RiskLevel::Medium);
        assert_eq!(compute_sla_risk_level(0.1, 0.01), RiskLevel::Low);
    }

    #[test]
    fn test_drift_score_bounds() {
        assert_eq!(compute_performance_drift_score(-0.5, -0.2), 0.0);
        assert!((compute_performance_drift_score(1.0, 1.0) - 1.0).abs() < 1e-12);
        assert!((compute_performance_drift_score(0.15, 0.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_forecast_adjustments() {
        let calm = compute_forecast_adjustments(RiskLevel::Low, RiskLevel::Low, 0.1);
        assert_eq!(calm, ForecastAdjustments::default());

        let stressed = compute_forecast_adjustments(RiskLevel::High, RiskLevel::Medium, 0.8);
        assert_eq!(stressed.cost_weight_multiplier, 1.25);
        assert_eq!(stressed.provider_penalty, 0.9);
        assert!(stressed.exploration_boost);
        assert!(stressed.ts_alpha_decay < 1.0);

        let medium = compute_forecast_adjustments(RiskLevel::Medium, RiskLevel::High, 0.5);
        assert_eq!(medium.cost_weight_multiplier, 1.125);
        assert_eq!(medium.provider_penalty, 0.8);
        assert!(!medium.exploration_boost);
    }

    #[test]
    fn test_cost_adjustment_renormalizes() {
        let adjusted = apply_forecast_cost_adjustment(CostAwareWeights::BALANCED, 1.25);
        assert!(adjusted.w_cost > 0.20);
        assert!((adjusted.sum() - 1.0).abs() < 1e-9);
        assert_eq!(
            apply_forecast_cost_adjustment(CostAwareWeights::BALANCED, f64::NAN),
            CostAwareWeights::BALANCED
        );
    }

    #[test]
    fn test_state_hints_use_budget() {
        let state = ForecastState {
            tenant_id: "t1".into(),
            feature: "chat".into(),
            projected_monthly_cost: 95.0,
            burn_rate: 95.0 / 30.0,
            smoothed_monthly_cost: 90.0,
            sla_risk_level: RiskLevel::Low,
            performance_drift_score: 0.0,
            degraded_providers: vec![Provider::OpenAi],
            last_updated: Utc::now(),
        };
        let budget = BudgetConfig {
            monthly_budget: 100.0,
            soft_limit_percentage: 0.8,
            routing_mode: RoutingMode::Balanced,
            current_month_usage: 0.0,
        };
        assert_eq!(state.adjustments(Some(&budget)).cost_weight_multiplier, 1.25);
        assert_eq!(state.adjustments(None).cost_weight_multiplier, 1.0);
        assert_eq!(state.hints(None).degraded_providers, vec![Provider::OpenAi]);
    }
}
