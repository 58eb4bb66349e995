//! Daily aggregation job
//!
//! Rolls raw call events up into per-day cost and performance rows, then
//! recomputes forecast state from those rows. Every write is an upsert keyed
//! by date, so re-running a day replaces its rows instead of adding to them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    DAYS_PER_MONTH, DailyCostRow, DailyPerformanceRow, ForecastState, RiskLevel, burn_rate_over,
    compute_error_rate_trend, compute_latency_drift, compute_performance_drift_score,
    compute_sla_risk_level, exponential_smoothing,
};
use crate::config::ForecastConfig;
use crate::error::{Error, Result};
use crate::routing::types::Provider;
use crate::store::{CallEvent, EventLog, ForecastStore};

/// Length of each of the two windows compared for SLA drift
const SLA_WINDOW_DAYS: i64 = 7;

/// Rows written by one stage and the groups that failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub rows: usize,
    pub errors: Vec<String>,
}

/// Outcome of a full aggregation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub date: NaiveDate,
    pub cost_rows: usize,
    pub performance_rows: usize,
    pub forecast_states: usize,
    /// Raw events deleted for having left the retention window
    pub events_pruned: u64,
    /// Non-fatal failures, one per group or stage
    pub errors: Vec<String>,
}

impl AggregationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Group one day's events by `(tenant, feature, provider)`
pub fn group_daily_costs(events: &[CallEvent], date: NaiveDate) -> Vec<DailyCostRow> {
    let mut groups: BTreeMap<(String, String, Provider), (f64, u64)> = BTreeMap::new();
    for event in events.iter().filter(|e| e.day() == date) {
        let entry = groups
            .entry((
                event.tenant_id.clone(),
                event.feature.clone(),
                event.provider.clone(),
            ))
            .or_default();
        entry.0 += event.cost_usd;
        entry.1 += 1;
    }

    groups
        .into_iter()
        .map(|((tenant_id, feature, provider), (total_cost_usd, call_count))| DailyCostRow {
            date,
            tenant_id,
            feature,
            provider,
            total_cost_usd,
            call_count,
        })
        .collect()
}

/// Group one day's events by `(provider, feature)`
pub fn group_daily_performance(events: &[CallEvent], date: NaiveDate) -> Vec<DailyPerformanceRow> {
    #[derive(Default)]
    struct Acc {
        latency_sum: f64,
        failures: u64,
        calls: u64,
    }

    let mut groups: BTreeMap<(Provider, String), Acc> = BTreeMap::new();
    for event in events.iter().filter(|e| e.day() == date) {
        let acc = groups
            .entry((event.provider.clone(), event.feature.clone()))
            .or_default();
        acc.latency_sum += event.latency_ms;
        acc.calls += 1;
        if !event.success {
            acc.failures += 1;
        }
    }

    groups
        .into_iter()
        .map(|((provider, feature), acc)| DailyPerformanceRow {
            date,
            provider,
            feature,
            avg_latency_ms: acc.latency_sum / acc.calls as f64,
            error_rate: acc.failures as f64 / acc.calls as f64,
            call_count: acc.calls,
        })
        .collect()
}

/// Call-weighted daily latency and error rate, split into the window ending
/// at `date` and the window before it
fn sla_windows<'a>(
    rows: impl Iterator<Item = &'a DailyPerformanceRow>,
    date: NaiveDate,
) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut per_day: BTreeMap<NaiveDate, (f64, f64, u64)> = BTreeMap::new();
    for row in rows {
        let day = per_day.entry(row.date).or_default();
        let weight = row.call_count.max(1);
        day.0 += row.avg_latency_ms * weight as f64;
        day.1 += row.error_rate * weight as f64;
        day.2 += weight;
    }

    let current_start = date - Duration::days(SLA_WINDOW_DAYS - 1);
    let previous_start = current_start - Duration::days(SLA_WINDOW_DAYS);
    let (mut cur_lat, mut cur_err, mut prev_lat, mut prev_err) =
        (Vec::new(), Vec::new(), Vec::new(), Vec::new());

    for (day, (latency, errors, calls)) in per_day {
        let latency = latency / calls as f64;
        let error_rate = errors / calls as f64;
        if day >= current_start && day <= date {
            cur_lat.push(latency);
            cur_err.push(error_rate);
        } else if day >= previous_start && day < current_start {
            prev_lat.push(latency);
            prev_err.push(error_rate);
        }
    }
    (cur_lat, cur_err, prev_lat, prev_err)
}

/// SLA risk and drift score over a set of performance rows
fn sla_assessment<'a>(
    rows: impl Iterator<Item = &'a DailyPerformanceRow>,
    date: NaiveDate,
) -> (RiskLevel, f64) {
    let (cur_lat, cur_err, prev_lat, prev_err) = sla_windows(rows, date);
    let latency_drift = compute_latency_drift(&cur_lat, &prev_lat);
    let error_trend = compute_error_rate_trend(&cur_err, &prev_err);
    (
        compute_sla_risk_level(latency_drift, error_trend),
        compute_performance_drift_score(latency_drift, error_trend),
    )
}

/// Calendar-day spend from the first active day through `date`
///
/// Days without cost rows count as zero spend. The series never reaches
/// back more than `history_days` days, and rows after `date` are ignored.
fn daily_spend_series(costs: &[DailyCostRow], date: NaiveDate, history_days: i64) -> Vec<f64> {
    let horizon = date - Duration::days(history_days.max(1) - 1);
    let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in costs.iter().filter(|r| r.date >= horizon && r.date <= date) {
        *totals.entry(row.date).or_default() += row.total_cost_usd;
    }
    let Some(&first) = totals.keys().next() else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|d| *d <= date)
        .map(|d| totals.get(&d).copied().unwrap_or(0.0))
        .collect()
}

/// Forecast for one `(tenant, feature)` from its aggregated history
///
/// `costs` must hold only this tenant and feature; `performance` may hold
/// any feature and is filtered here. Burn rate and smoothing run over
/// calendar days, so idle days inside the window pull the projection down.
pub fn compute_forecast_state(
    tenant_id: &str,
    feature: &str,
    costs: &[DailyCostRow],
    performance: &[DailyPerformanceRow],
    date: NaiveDate,
    config: &ForecastConfig,
) -> ForecastState {
    let daily = daily_spend_series(costs, date, config.history_days);

    let burn = burn_rate_over(&daily, config.burn_window_days);
    let smoothed = exponential_smoothing(&daily, config.smoothing_alpha);

    let feature_rows = move || performance.iter().filter(move |r| r.feature == feature);
    let (sla_risk_level, performance_drift_score) = sla_assessment(feature_rows(), date);

    let providers: BTreeSet<&Provider> = feature_rows().map(|r| &r.provider).collect();
    let degraded_providers = providers
        .into_iter()
        .filter(|provider| {
            let (risk, _) = sla_assessment(feature_rows().filter(|r| &r.provider == *provider), date);
            risk >= RiskLevel::Medium
        })
        .cloned()
        .collect();

    ForecastState {
        tenant_id: tenant_id.to_string(),
        feature: feature.to_string(),
        projected_monthly_cost: burn.projected_monthly_cost,
        burn_rate: burn.burn_rate,
        smoothed_monthly_cost: smoothed * DAYS_PER_MONTH,
        sla_risk_level,
        performance_drift_score,
        degraded_providers,
        last_updated: Utc::now(),
    }
}

/// Batch job writing daily aggregates and forecast state
pub struct DailyAggregator {
    events: Arc<dyn EventLog>,
    forecasts: Arc<dyn ForecastStore>,
    config: ForecastConfig,
}

impl DailyAggregator {
    pub fn new(
        events: Arc<dyn EventLog>,
        forecasts: Arc<dyn ForecastStore>,
        config: ForecastConfig,
    ) -> Self {
        Self {
            events,
            forecasts,
            config,
        }
    }

    pub async fn aggregate_daily_costs(&self, date: NaiveDate) -> Result<StageReport> {
        let events = self.events.list_for_day(date).await?;
        let mut report = StageReport::default();

        for row in group_daily_costs(&events, date) {
            match self.forecasts.upsert_daily_cost(&row).await {
                Ok(()) => report.rows += 1,
                Err(e) => {
                    let group = format!("cost {}/{}/{} on {}", row.tenant_id, row.feature, row.provider, date);
                    warn!(group = %group, error = %e, "Daily cost upsert failed");
                    report.errors.push(Error::AggregationFailed(group, e.to_string()).to_string());
                }
            }
        }

        info!(%date, rows = report.rows, failed = report.errors.len(), "Aggregated daily costs");
        Ok(report)
    }

    pub async fn aggregate_daily_performance(&self, date: NaiveDate) -> Result<StageReport> {
        let events = self.events.list_for_day(date).await?;
        let mut report = StageReport::default();

        for row in group_daily_performance(&events, date) {
            match self.forecasts.upsert_daily_performance(&row).await {
                Ok(()) => report.rows += 1,
                Err(e) => {
                    let group = format!("performance {}/{} on {}", row.provider, row.feature, date);
                    warn!(group = %group, error = %e, "Daily performance upsert failed");
                    report.errors.push(Error::AggregationFailed(group, e.to_string()).to_string());
                }
            }
        }

        info!(%date, rows = report.rows, failed = report.errors.len(), "Aggregated daily performance");
        Ok(report)
    }

    /// Recompute forecast state for every `(tenant, feature)` with cost
    /// activity in the history window ending at `date`
    pub async fn update_forecast_state(&self, date: NaiveDate) -> Result<StageReport> {
        let history_start = date - Duration::days(self.config.history_days.max(1) - 1);
        let sla_start = date - Duration::days(2 * SLA_WINDOW_DAYS - 1);

        let costs = self.forecasts.daily_costs_between(history_start, date).await?;
        let performance = self.forecasts.daily_performance_between(sla_start, date).await?;

        let mut groups: BTreeMap<(String, String), Vec<DailyCostRow>> = BTreeMap::new();
        for row in costs {
            groups
                .entry((row.tenant_id.clone(), row.feature.clone()))
                .or_default()
                .push(row);
        }

        let mut report = StageReport::default();
        for ((tenant_id, feature), rows) in groups {
            let state =
                compute_forecast_state(&tenant_id, &feature, &rows, &performance, date, &self.config);
            match self.forecasts.upsert(&state).await {
                Ok(()) => report.rows += 1,
                Err(e) => {
                    let group = format!("forecast {}/{}", tenant_id, feature);
                    warn!(group = %group, error = %e, "Forecast state upsert failed");
                    report.errors.push(Error::AggregationFailed(group, e.to_string()).to_string());
                }
            }
        }

        info!(%date, states = report.rows, failed = report.errors.len(), "Updated forecast state");
        Ok(report)
    }

    /// First day whose raw events outlive a run for `date`
    ///
    /// Covers both the cost history and the two SLA windows.
    pub fn retention_cutoff(&self, date: NaiveDate) -> NaiveDate {
        let days = self.config.history_days.max(2 * SLA_WINDOW_DAYS);
        date - Duration::days(days - 1)
    }

    /// Run every stage for `date`, then drop raw events older than the
    /// retention window; a failed stage is reported and the next stage
    /// still runs
    pub async fn run(&self, date: NaiveDate) -> AggregationReport {
        let mut report = AggregationReport {
            date,
            cost_rows: 0,
            performance_rows: 0,
            forecast_states: 0,
            events_pruned: 0,
            errors: Vec::new(),
        };

        match self.aggregate_daily_costs(date).await {
            Ok(stage) => {
                report.cost_rows = stage.rows;
                report.errors.extend(stage.errors);
            }
            Err(e) => report.errors.push(stage_failure("daily costs", date, e)),
        }

        match self.aggregate_daily_performance(date).await {
            Ok(stage) => {
                report.performance_rows = stage.rows;
                report.errors.extend(stage.errors);
            }
            Err(e) => report.errors.push(stage_failure("daily performance", date, e)),
        }

        match self.update_forecast_state(date).await {
            Ok(stage) => {
                report.forecast_states = stage.rows;
                report.errors.extend(stage.errors);
            }
            Err(e) => report.errors.push(stage_failure("forecast state", date, e)),
        }

        match self.events.prune_before(self.retention_cutoff(date)).await {
            Ok(pruned) => report.events_pruned = pruned,
            Err(e) => report.errors.push(stage_failure("event pruning", date, e)),
        }

        info!(
            %date,
            cost_rows = report.cost_rows,
            performance_rows = report.performance_rows,
            forecast_states = report.forecast_states,
            events_pruned = report.events_pruned,
            errors = report.errors.len(),
            "Daily aggregation finished"
        );
        report
    }
}

fn stage_failure(stage: &str, date: NaiveDate, error: Error) -> String {
    warn!(stage, %date, error = %error, "Aggregation stage failed");
    Error::AggregationFailed(format!("{} on {}", stage, date), error.to_string()).to_string()
}
