//! Storage ports and backends
//!
//! Rankers never touch storage; the routing service reads a snapshot through
//! these traits before ranking and writes outcomes through them afterwards.
//! Two backends implement every port: [`MemoryStore`] and [`SqliteStore`].

pub mod memory;
pub mod migrations;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::forecast::{DailyCostRow, DailyPerformanceRow, ForecastState};
use crate::routing::types::{
    BudgetConfig, MetricsKey, MetricsRow, Outcome, PenaltyRow, Provider, ProviderCandidate,
    UsageRow,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read-modify-write step passed to [`MetricsStore::update`]
pub type RowUpdate<'a> = &'a (dyn Fn(Option<&MetricsRow>) -> MetricsRow + Send + Sync);

/// Per-key provider statistics
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn get(&self, key: &MetricsKey) -> Result<Option<MetricsRow>>;

    /// Insert or replace the row at `row.key`
    async fn upsert(&self, row: &MetricsRow) -> Result<()>;

    /// Atomically replace the row at `key` with `apply(existing)`
    ///
    /// No other write to the same key interleaves between the read and the
    /// write, so concurrent updates never lose an observation.
    async fn update(&self, key: &MetricsKey, apply: RowUpdate<'_>) -> Result<MetricsRow>;
}

/// Tenant budgets
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<BudgetConfig>>;

    async fn upsert(&self, tenant_id: &str, budget: &BudgetConfig) -> Result<()>;
}

/// SLA penalty records, one per `(provider, feature)`
#[async_trait]
pub trait PenaltyStore: Send + Sync {
    /// Penalties for a feature that have not expired at `now`
    async fn list_active(&self, feature: &str, now: DateTime<Utc>) -> Result<Vec<PenaltyRow>>;

    async fn upsert(&self, row: &PenaltyRow) -> Result<()>;
}

/// Per-provider call counters in hourly buckets
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically count one call in the bucket containing `at`
    ///
    /// Buckets that have left the 24-hour window ending at `at` are dropped.
    async fn record_call(&self, provider: &Provider, at: DateTime<Utc>) -> Result<()>;

    /// Usage share per provider over the 24 hours ending at `now`
    async fn list_24h(&self, now: DateTime<Utc>) -> Result<Vec<UsageRow>>;
}

/// Record of completed provider calls
///
/// Appends are best-effort: at most once, never retried, and a failure is
/// logged by the caller rather than surfaced.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &CallEvent) -> Result<()>;

    /// Every event created on the given UTC day
    async fn list_for_day(&self, date: NaiveDate) -> Result<Vec<CallEvent>>;

    /// Delete events from days before `cutoff`, returning how many went
    async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64>;
}

/// Forecast state and the daily aggregates it is derived from
#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn get(&self, tenant_id: &str, feature: &str) -> Result<Option<ForecastState>>;

    async fn upsert(&self, state: &ForecastState) -> Result<()>;

    async fn list(&self) -> Result<Vec<ForecastState>>;

    /// Insert or replace the row keyed by `(date, tenant, feature, provider)`
    async fn upsert_daily_cost(&self, row: &DailyCostRow) -> Result<()>;

    /// Insert or replace the row keyed by `(date, provider, feature)`
    async fn upsert_daily_performance(&self, row: &DailyPerformanceRow) -> Result<()>;

    /// Rows with `start <= date <= end`
    async fn daily_costs_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyCostRow>>;

    /// Rows with `start <= date <= end`
    async fn daily_performance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>>;
}

/// One completed provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub feature: String,
    pub purpose: String,
    pub provider: Provider,
    pub model: String,
    pub latency_ms: f64,
    /// Absolute call cost; falls back to the per-1k cost when unknown
    pub cost_usd: f64,
    /// Quality on a 0-100 scale
    pub quality: f64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

impl CallEvent {
    pub fn new(
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
        outcome: &Outcome,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            feature: feature.to_string(),
            purpose: purpose.to_string(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            latency_ms: outcome.latency_ms,
            cost_usd: outcome.cost_usd.unwrap_or(outcome.cost_per_1k),
            quality: outcome.quality_avg,
            success: outcome.success,
            created_at,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

/// Hour bucket index for a timestamp
pub(crate) fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

/// Hour buckets covered by the usage window
pub(crate) const USAGE_WINDOW_HOURS: i64 = 24;

/// Turn per-provider call counts into usage percentages, sorted by provider
pub(crate) fn usage_shares(counts: impl IntoIterator<Item = (Provider, u64)>) -> Vec<UsageRow> {
    let mut totals: std::collections::BTreeMap<Provider, u64> = std::collections::BTreeMap::new();
    for (provider, count) in counts {
        *totals.entry(provider).or_default() += count;
    }
    let total: u64 = totals.values().sum();
    if total == 0 {
        return Vec::new();
    }
    totals
        .into_iter()
        .map(|(provider, count)| UsageRow {
            provider,
            usage_percentage: count as f64 * 100.0 / total as f64,
        })
        .collect()
}
