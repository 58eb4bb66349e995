//! In-process store backed by lock-guarded maps
//!
//! Nothing survives a restart. Used by tests and by embedders that keep
//! statistics elsewhere.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{
    BudgetStore, CallEvent, EventLog, ForecastStore, MetricsStore, PenaltyStore, RowUpdate,
    UsageStore, USAGE_WINDOW_HOURS, hour_bucket, usage_shares,
};
use crate::error::Result;
use crate::forecast::{DailyCostRow, DailyPerformanceRow, ForecastState};
use crate::routing::types::{BudgetConfig, MetricsKey, MetricsRow, PenaltyRow, Provider, UsageRow};

type DailyCostKey = (NaiveDate, String, String, Provider);
type DailyPerformanceKey = (NaiveDate, Provider, String);

/// Store implementing every port in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    metrics: RwLock<HashMap<MetricsKey, MetricsRow>>,
    budgets: RwLock<HashMap<String, BudgetConfig>>,
    penalties: RwLock<HashMap<(Provider, String), PenaltyRow>>,
    usage: RwLock<BTreeMap<(i64, Provider), u64>>,
    events: RwLock<Vec<CallEvent>>,
    forecasts: RwLock<HashMap<(String, String), ForecastState>>,
    daily_costs: RwLock<BTreeMap<DailyCostKey, DailyCostRow>>,
    daily_performance: RwLock<BTreeMap<DailyPerformanceKey, DailyPerformanceRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded so far
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn get(&self, key: &MetricsKey) -> Result<Option<MetricsRow>> {
        Ok(self.metrics.read().await.get(key).cloned())
    }

    async fn upsert(&self, row: &MetricsRow) -> Result<()> {
        self.metrics
            .write()
            .await
            .insert(row.key.clone(), row.clone());
        Ok(())
    }

    async fn update(&self, key: &MetricsKey, apply: RowUpdate<'_>) -> Result<MetricsRow> {
        let mut metrics = self.metrics.write().await;
        let mut next = apply(metrics.get(key));
        next.key = key.clone();
        metrics.insert(key.clone(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl BudgetStore for MemoryStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<BudgetConfig>> {
        Ok(self.budgets.read().await.get(tenant_id).cloned())
    }

    async fn upsert(&self, tenant_id: &str, budget: &BudgetConfig) -> Result<()> {
        self.budgets
            .write()
            .await
            .insert(tenant_id.to_string(), budget.clone());
        Ok(())
    }
}

#[async_trait]
impl PenaltyStore for MemoryStore {
    async fn list_active(&self, feature: &str, now: DateTime<Utc>) -> Result<Vec<PenaltyRow>> {
        let mut rows: Vec<PenaltyRow> = self
            .penalties
            .read()
            .await
            .values()
            .filter(|p| p.feature == feature && p.is_active(now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(rows)
    }

    async fn upsert(&self, row: &PenaltyRow) -> Result<()> {
        self.penalties
            .write()
            .await
            .insert((row.provider.clone(), row.feature.clone()), row.clone());
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_call(&self, provider: &Provider, at: DateTime<Utc>) -> Result<()> {
        let bucket = hour_bucket(at);
        let mut usage = self.usage.write().await;
        *usage.entry((bucket, provider.clone())).or_default() += 1;
        usage.retain(|(b, _), _| *b > bucket - USAGE_WINDOW_HOURS);
        Ok(())
    }

    async fn list_24h(&self, now: DateTime<Utc>) -> Result<Vec<UsageRow>> {
        let current = hour_bucket(now);
        let usage = self.usage.read().await;
        Ok(usage_shares(
            usage
                .iter()
                .filter(|((bucket, _), _)| *bucket > current - USAGE_WINDOW_HOURS && *bucket <= current)
                .map(|((_, provider), count)| (provider.clone(), *count)),
        ))
    }
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(&self, event: &CallEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list_for_day(&self, date: NaiveDate) -> Result<Vec<CallEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.day() == date)
            .cloned()
            .collect())
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.day() >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[async_trait]
impl ForecastStore for MemoryStore {
    async fn get(&self, tenant_id: &str, feature: &str) -> Result<Option<ForecastState>> {
        Ok(self
            .forecasts
            .read()
            .await
            .get(&(tenant_id.to_string(), feature.to_string()))
            .cloned())
    }

    async fn upsert(&self, state: &ForecastState) -> Result<()> {
        self.forecasts.write().await.insert(
            (state.tenant_id.clone(), state.feature.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ForecastState>> {
        let mut states: Vec<ForecastState> = self.forecasts.read().await.values().cloned().collect();
        states.sort_by(|a, b| (&a.tenant_id, &a.feature).cmp(&(&b.tenant_id, &b.feature)));
        Ok(states)
    }

    async fn upsert_daily_cost(&self, row: &DailyCostRow) -> Result<()> {
        let key = (
            row.date,
            row.tenant_id.clone(),
            row.feature.clone(),
            row.provider.clone(),
        );
        self.daily_costs.write().await.insert(key, row.clone());
        Ok(())
    }

    async fn upsert_daily_performance(&self, row: &DailyPerformanceRow) -> Result<()> {
        let key = (row.date, row.provider.clone(), row.feature.clone());
        self.daily_performance.write().await.insert(key, row.clone());
        Ok(())
    }

    async fn daily_costs_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyCostRow>> {
        Ok(self
            .daily_costs
            .read()
            .await
            .values()
            .filter(|r| r.date >= start && r.date <= end)
            .cloned()
            .collect())
    }

    async fn daily_performance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>> {
        Ok(self
            .daily_performance
            .read()
            .await
            .values()
            .filter(|r| r.date >= start && r.date <= end)
            .cloned()
            .collect())
    }
}
