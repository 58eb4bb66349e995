//! Routing service
//!
//! Glue between the pure rankers and the store ports. A ranking call fans out
//! its reads (metrics for every candidate and scope, budget, penalties, usage,
//! forecast), joins them into a [`RankingSnapshot`], and ranks. Outcome
//! reports go the other way: an atomic metrics update through the strategy's
//! updater, then a best-effort usage bump and event append.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::strategy::{Ranker, RoutingStrategy};
use super::types::{
    BudgetConfig, CandidateMetrics, MetricsKey, MetricsRow, MetricsScope, Outcome, PenaltyRow,
    Provider, ProviderCandidate, RankResult, RankingSnapshot,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::forecast::{AggregationReport, DailyAggregator, ForecastState};
use crate::random::{RandomSource, SeededRandom};
use crate::store::{
    BudgetStore, CallEvent, EventLog, ForecastStore, MetricsStore, PenaltyStore, UsageStore,
};

/// Shared handles to every store port
#[derive(Clone)]
pub struct RoutingStores {
    pub metrics: Arc<dyn MetricsStore>,
    pub budgets: Arc<dyn BudgetStore>,
    pub penalties: Arc<dyn PenaltyStore>,
    pub usage: Arc<dyn UsageStore>,
    pub events: Arc<dyn EventLog>,
    pub forecasts: Arc<dyn ForecastStore>,
}

impl RoutingStores {
    /// Serve every port from one backend
    pub fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: MetricsStore + BudgetStore + PenaltyStore + UsageStore + EventLog + ForecastStore + 'static,
    {
        Self {
            metrics: store.clone(),
            budgets: store.clone(),
            penalties: store.clone(),
            usage: store.clone(),
            events: store.clone(),
            forecasts: store,
        }
    }
}

type CacheKey = (String, String, String);

/// Last ranking per `(tenant, feature, purpose)`
///
/// Held only in process memory and lost on restart. Nothing reads it back
/// into a ranking decision.
#[derive(Debug, Default)]
pub struct ScoreCache {
    entries: RwLock<HashMap<CacheKey, RankResult>>,
}

impl ScoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, tenant_id: &str, feature: &str, purpose: &str) -> Option<RankResult> {
        self.entries
            .read()
            .await
            .get(&(tenant_id.to_string(), feature.to_string(), purpose.to_string()))
            .cloned()
    }

    pub async fn insert(&self, tenant_id: &str, feature: &str, purpose: &str, result: RankResult) {
        self.entries.write().await.insert(
            (tenant_id.to_string(), feature.to_string(), purpose.to_string()),
            result,
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// What an outcome report managed to persist
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    /// Every requested metrics row was written
    pub metrics_updated: bool,
    pub usage_recorded: bool,
    pub event_logged: bool,
    /// Rows as written, one per updated scope
    pub rows: Vec<MetricsRow>,
}

/// Ranking and outcome-learning entry point
pub struct RoutingService {
    stores: RoutingStores,
    config: Config,
    /// Pinned random source; `None` draws a fresh generator per call
    rng: Option<Mutex<Box<dyn RandomSource>>>,
    cache: ScoreCache,
}

impl RoutingService {
    /// Create a service that seeds a new generator for every ranking call
    pub fn new(stores: RoutingStores, config: Config) -> Self {
        Self {
            stores,
            config,
            rng: None,
            cache: ScoreCache::new(),
        }
    }

    /// Pin one shared random source (for reproducible rankings)
    ///
    /// Every ranking call then draws from this source in turn, so concurrent
    /// calls serialize on it. Use [`RoutingService::rank_with`] to keep
    /// reproducibility without sharing.
    pub fn with_random(mut self, rng: impl RandomSource + 'static) -> Self {
        self.rng = Some(Mutex::new(Box::new(rng)));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &RoutingStores {
        &self.stores
    }

    pub fn cache(&self) -> &ScoreCache {
        &self.cache
    }

    /// Rank with the configured default strategy
    pub async fn rank_default(
        &self,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankResult> {
        self.rank(self.config.routing.default_strategy, tenant_id, feature, purpose, candidates)
            .await
    }

    pub async fn rank_hybrid(
        &self,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankResult> {
        self.rank(RoutingStrategy::Hybrid, tenant_id, feature, purpose, candidates)
            .await
    }

    pub async fn rank_cost_aware(
        &self,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankResult> {
        self.rank(RoutingStrategy::CostAware, tenant_id, feature, purpose, candidates)
            .await
    }

    pub async fn rank_thompson(
        &self,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankResult> {
        self.rank(RoutingStrategy::Thompson, tenant_id, feature, purpose, candidates)
            .await
    }

    /// Rank `candidates` for one request
    ///
    /// Fails only when the metrics store cannot be read. Budget, penalty,
    /// usage and forecast read failures fall back to their neutral defaults.
    pub async fn rank(
        &self,
        strategy: RoutingStrategy,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankResult> {
        let Some(pinned) = &self.rng else {
            let mut rng = SeededRandom::from_entropy();
            return self
                .rank_with(strategy, tenant_id, feature, purpose, candidates, &mut rng)
                .await;
        };

        let snapshot = self
            .snapshot(strategy, tenant_id, feature, purpose, candidates)
            .await?;
        let result = {
            let mut rng = pinned.lock().await;
            strategy.ranker(&self.config).rank(&snapshot, &mut **rng)
        };
        self.finish(strategy, tenant_id, feature, purpose, result).await
    }

    /// Rank with a caller-owned random source
    ///
    /// Shares no state with other ranking calls apart from the stores and
    /// the score cache.
    pub async fn rank_with(
        &self,
        strategy: RoutingStrategy,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
        rng: &mut dyn RandomSource,
    ) -> Result<RankResult> {
        let snapshot = self
            .snapshot(strategy, tenant_id, feature, purpose, candidates)
            .await?;
        let result = strategy.ranker(&self.config).rank(&snapshot, rng);
        self.finish(strategy, tenant_id, feature, purpose, result).await
    }

    async fn finish(
        &self,
        strategy: RoutingStrategy,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        result: RankResult,
    ) -> Result<RankResult> {
        if result.ranked.is_empty() {
            return Ok(result);
        }

        info!(
            strategy = %strategy,
            tenant = %tenant_id,
            feature = %feature,
            purpose = %purpose,
            selected = ?result.selected.as_ref().map(|c| c.to_string()),
            mode = %result.mode,
            explored = result.diagnostics.explored,
            "Ranked providers"
        );

        self.cache
            .insert(tenant_id, feature, purpose, result.clone())
            .await;
        Ok(result)
    }

    async fn snapshot(
        &self,
        strategy: RoutingStrategy,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidates: &[ProviderCandidate],
    ) -> Result<RankingSnapshot> {
        let now = Utc::now();
        if candidates.is_empty() {
            return Ok(RankingSnapshot::new(tenant_id, feature, purpose, Vec::new(), now));
        }

        let metric_reads = candidates.iter().map(|candidate| {
            let metrics = self.stores.metrics.clone();
            let global = MetricsKey::global(feature, purpose, candidate);
            let tenant = MetricsKey::tenant(tenant_id, feature, purpose, candidate);
            async move {
                let (global_row, tenant_row) =
                    tokio::try_join!(metrics.get(&global), metrics.get(&tenant))?;
                Ok::<_, Error>(CandidateMetrics {
                    candidate: candidate.clone(),
                    global: global_row,
                    tenant: tenant_row,
                })
            }
        });

        let wants_forecast = strategy != RoutingStrategy::Hybrid;
        let forecast_read = async {
            if wants_forecast {
                Some(self.stores.forecasts.get(tenant_id, feature).await)
            } else {
                None
            }
        };

        let (metrics, budget, penalties, usage, forecast) = tokio::join!(
            try_join_all(metric_reads),
            self.stores.budgets.get(tenant_id),
            self.stores.penalties.list_active(feature, now),
            self.stores.usage.list_24h(now),
            forecast_read,
        );

        let metrics = metrics.map_err(|e| {
            warn!(tenant = %tenant_id, feature = %feature, error = %e, "Metrics store unreachable");
            Error::MetricsUnavailable(format!("{}:{}", tenant_id, feature), e.to_string())
        })?;

        let budget = degrade("budget", budget).flatten();
        let penalties = degrade("penalties", penalties).unwrap_or_default();
        let usage = degrade("usage", usage).unwrap_or_default();
        let forecast = forecast.and_then(|read| degrade("forecast", read)).flatten();

        let mut snapshot = RankingSnapshot::new(tenant_id, feature, purpose, metrics, now)
            .with_penalties(penalties)
            .with_usage(usage);
        if let Some(state) = forecast {
            snapshot = snapshot.with_forecast(state.hints(budget.as_ref()));
        }
        if let Some(budget) = budget {
            snapshot = snapshot.with_budget(budget);
        }

        debug!(
            tenant = %tenant_id,
            feature = %feature,
            candidates = snapshot.candidates.len(),
            penalties = snapshot.penalties.len(),
            has_budget = snapshot.budget.is_some(),
            has_forecast = snapshot.forecast.is_some(),
            "Built ranking snapshot"
        );
        Ok(snapshot)
    }

    /// Fold one call outcome into the metrics row for `scope`
    ///
    /// Never fails: write errors are logged and reflected in the report.
    #[allow(clippy::too_many_arguments)]
    pub async fn report_outcome(
        &self,
        strategy: RoutingStrategy,
        scope: MetricsScope,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
        outcome: &Outcome,
    ) -> OutcomeReport {
        self.report(strategy, &[scope], tenant_id, feature, purpose, candidate, outcome)
            .await
    }

    /// Fold one call outcome into both the global and the tenant rows
    ///
    /// Usage and the event log are written once, not once per scope.
    pub async fn report_call(
        &self,
        strategy: RoutingStrategy,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
        outcome: &Outcome,
    ) -> OutcomeReport {
        self.report(
            strategy,
            &[MetricsScope::Global, MetricsScope::Tenant],
            tenant_id,
            feature,
            purpose,
            candidate,
            outcome,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn report(
        &self,
        strategy: RoutingStrategy,
        scopes: &[MetricsScope],
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
        outcome: &Outcome,
    ) -> OutcomeReport {
        if let Err(e) = outcome.validate() {
            warn!(provider = %candidate, error = %e, "Discarding invalid outcome");
            return OutcomeReport::default();
        }

        let now = Utc::now();
        let ranker = strategy.ranker(&self.config);
        let updates = scopes.iter().map(|scope| {
            let key = MetricsKey::for_scope(*scope, tenant_id, feature, purpose, candidate);
            self.update_metrics(ranker.as_ref(), key, outcome, now)
        });
        let rows: Vec<Option<MetricsRow>> = futures_util::future::join_all(updates).await;
        let metrics_updated = rows.iter().all(Option::is_some);

        let event = CallEvent::new(tenant_id, feature, purpose, candidate, outcome, now);
        let (usage, logged) = tokio::join!(
            self.stores.usage.record_call(&candidate.provider, now),
            self.stores.events.append(&event),
        );
        let usage_recorded = fail_open("usage", usage);
        let event_logged = fail_open("event log", logged);

        debug!(
            strategy = %strategy,
            provider = %candidate,
            success = outcome.success,
            metrics_updated,
            usage_recorded,
            event_logged,
            "Recorded call outcome"
        );

        OutcomeReport {
            metrics_updated,
            usage_recorded,
            event_logged,
            rows: rows.into_iter().flatten().collect(),
        }
    }

    async fn update_metrics(
        &self,
        ranker: &dyn Ranker,
        key: MetricsKey,
        outcome: &Outcome,
        now: chrono::DateTime<Utc>,
    ) -> Option<MetricsRow> {
        let apply = |existing: Option<&MetricsRow>| ranker.apply_outcome(existing, &key, outcome, now);
        match self.stores.metrics.update(&key, &apply).await {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(
                    scope = %key.scope,
                    provider = %key.provider,
                    model = %key.model,
                    error = %e,
                    "Metrics update failed"
                );
                None
            }
        }
    }

    /// Apply the default SLA penalty to a provider on a feature
    pub async fn record_sla_violation(&self, provider: &Provider, feature: &str) -> Result<PenaltyRow> {
        let row = PenaltyRow {
            provider: provider.clone(),
            feature: feature.to_string(),
            penalty_multiplier: self.config.sla.default_penalty_multiplier,
            expires_at: Utc::now() + Duration::minutes(self.config.sla.default_penalty_minutes),
        };
        self.stores.penalties.upsert(&row).await?;
        info!(
            provider = %provider,
            feature = %feature,
            multiplier = row.penalty_multiplier,
            expires_at = %row.expires_at,
            "Recorded SLA violation"
        );
        Ok(row)
    }

    pub async fn set_budget(&self, tenant_id: &str, budget: &BudgetConfig) -> Result<()> {
        self.stores.budgets.upsert(tenant_id, budget).await
    }

    pub async fn forecast(&self, tenant_id: &str, feature: &str) -> Result<Option<ForecastState>> {
        self.stores.forecasts.get(tenant_id, feature).await
    }

    pub async fn forecasts(&self) -> Result<Vec<ForecastState>> {
        self.stores.forecasts.list().await
    }

    /// Aggregate one day's events and refresh forecast state
    pub async fn run_daily_aggregation(&self, date: NaiveDate) -> AggregationReport {
        DailyAggregator::new(
            self.stores.events.clone(),
            self.stores.forecasts.clone(),
            self.config.forecast.clone(),
        )
        .run(date)
        .await
    }
}

/// Neutral fallback for a failed ranking-side read
fn degrade<T>(what: &str, read: Result<T>) -> Option<T> {
    match read {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(store = what, error = %e, "Store read failed, using neutral default");
            None
        }
    }
}

fn fail_open(what: &str, write: Result<()>) -> bool {
    match write {
        Ok(()) => true,
        Err(e) => {
            warn!(store = what, error = %e, "Post-call write failed");
            false
        }
    }
}
