//! Routewise Core Integration Tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routewise_core::{
    Error, Result,
    config::Config,
    forecast::{ForecastState, RiskLevel},
    random::{FixedSequence, RandomSource, SeededRandom},
    routing::{
        BudgetConfig, MetricsKey, MetricsRow, MetricsScope, Outcome, Provider, ProviderCandidate,
        RoutingMode, RoutingService, RoutingStores, RoutingStrategy,
        types::{PenaltyRow, UsageRow},
    },
    store::{
        BudgetStore, ForecastStore, MemoryStore, MetricsStore, PenaltyStore, RowUpdate,
        SqliteStore, UsageStore,
    },
};
use tempfile::TempDir;

fn openai() -> ProviderCandidate {
    ProviderCandidate::new(Provider::OpenAi, "gpt-4o")
}

fn anthropic() -> ProviderCandidate {
    ProviderCandidate::new(Provider::Anthropic, "claude-sonnet")
}

fn memory_service() -> (Arc<MemoryStore>, RoutingService) {
    let store = Arc::new(MemoryStore::new());
    let service = RoutingService::new(RoutingStores::from_backend(store.clone()), Config::default())
        .with_random(FixedSequence::new(vec![0.99]));
    (store, service)
}

/// Report `n` calls per candidate: anthropic good, openai failing
async fn train(service: &RoutingService, strategy: RoutingStrategy, n: usize) {
    for _ in 0..n {
        service
            .report_call(
                strategy,
                "acme",
                "chat",
                "answer",
                &anthropic(),
                &Outcome::new(300.0, 0.002, 92.0, true),
            )
            .await;
        service
            .report_call(
                strategy,
                "acme",
                "chat",
                "answer",
                &openai(),
                &Outcome::new(300.0, 0.002, 40.0, false),
            )
            .await;
    }
}

#[tokio::test]
async fn test_cost_aware_learns_from_outcomes() {
    let (_, service) = memory_service();
    train(&service, RoutingStrategy::CostAware, 10).await;

    let result = service
        .rank_cost_aware("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert_eq!(result.ranked.len(), 2);
    assert_eq!(result.ranked[0].candidate, anthropic());
    assert_eq!(result.selected, Some(anthropic()));
    assert_eq!(result.diagnostics.tenant_samples, 20);
    assert!(!result.diagnostics.explored);
}

#[tokio::test]
async fn test_hybrid_and_cost_aware_share_ewma_rows() {
    let (store, service) = memory_service();
    train(&service, RoutingStrategy::Hybrid, 3).await;

    let key = MetricsKey::tenant("acme", "chat", "answer", &anthropic());
    let row = MetricsStore::get(store.as_ref(), &key).await.unwrap().unwrap();
    assert_eq!(row.sample_count, 3);
    assert!(row.posterior.is_none());

    let hybrid = service
        .rank_hybrid("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert_eq!(hybrid.ranked[0].candidate, anthropic());
    assert!(!hybrid.diagnostics.forecast_applied);
}

#[tokio::test]
async fn test_thompson_end_to_end_on_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let service = RoutingService::new(RoutingStores::from_backend(store.clone()), Config::default())
        .with_random(SeededRandom::from_seed(11));
    train(&service, RoutingStrategy::Thompson, 30).await;

    let key = MetricsKey::global("chat", "answer", &openai());
    let row = MetricsStore::get(store.as_ref(), &key).await.unwrap().unwrap();
    let posterior = row.posterior.unwrap();
    assert_eq!(posterior.ts_alpha, 1.0);
    assert_eq!(posterior.ts_beta, 31.0);

    let result = service
        .rank_thompson("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert_eq!(result.selected, Some(anthropic()));
    assert_eq!(result.strategy, RoutingStrategy::Thompson);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reports_lose_no_samples() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::connect(&dir.path().join("routewise.db")).await.unwrap());
    let service = Arc::new(RoutingService::new(
        RoutingStores::from_backend(store.clone()),
        Config::default(),
    ));

    let mut handles = Vec::new();
    for i in 0..50 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .report_outcome(
                    RoutingStrategy::Thompson,
                    MetricsScope::Tenant,
                    "acme",
                    "chat",
                    "answer",
                    &anthropic(),
                    &Outcome::new(200.0 + i as f64, 0.002, 90.0, i % 2 == 0),
                )
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().metrics_updated);
    }

    let key = MetricsKey::tenant("acme", "chat", "answer", &anthropic());
    let row = MetricsStore::get(store.as_ref(), &key).await.unwrap().unwrap();
    assert_eq!(row.sample_count, 50);
    let posterior = row.posterior.unwrap();
    assert_eq!(posterior.ts_alpha + posterior.ts_beta, 52.0);

    let usage = store.list_24h(Utc::now()).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert!((usage[0].usage_percentage - 100.0).abs() < 1e-9);
}

/// Random source that blocks its first draw until a peer source draws too
struct Rendezvous {
    arrivals: Arc<(Mutex<usize>, Condvar)>,
    met_peer: Arc<AtomicBool>,
    inner: SeededRandom,
    waited: bool,
}

impl RandomSource for Rendezvous {
    fn next_f64(&mut self) -> f64 {
        if !self.waited {
            self.waited = true;
            let (count, ready) = &*self.arrivals;
            let mut arrived = count.lock().unwrap();
            *arrived += 1;
            ready.notify_all();
            let (arrived, timeout) = ready
                .wait_timeout_while(arrived, Duration::from_secs(5), |n| *n < 2)
                .unwrap();
            self.met_peer.store(!timeout.timed_out() && *arrived >= 2, Ordering::SeqCst);
        }
        self.inner.next_f64()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rankings_for_different_tenants_run_in_parallel() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(RoutingService::new(
        RoutingStores::from_backend(store),
        Config::default(),
    ));
    let arrivals = Arc::new((Mutex::new(0), Condvar::new()));

    let handles: Vec<_> = ["acme", "globex"]
        .into_iter()
        .enumerate()
        .map(|(i, tenant)| {
            let service = service.clone();
            let met_peer = Arc::new(AtomicBool::new(false));
            let mut rng = Rendezvous {
                arrivals: arrivals.clone(),
                met_peer: met_peer.clone(),
                inner: SeededRandom::from_seed(i as u64),
                waited: false,
            };
            let handle = tokio::spawn(async move {
                service
                    .rank_with(
                        RoutingStrategy::Thompson,
                        tenant,
                        "chat",
                        "answer",
                        &[openai(), anthropic()],
                        &mut rng,
                    )
                    .await
            });
            (handle, met_peer)
        })
        .collect();

    for (handle, met_peer) in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.selected.is_some());
        // Both draws were in flight at once
        assert!(met_peer.load(Ordering::SeqCst));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unpinned_service_ranks_concurrently() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(RoutingService::new(
        RoutingStores::from_backend(store),
        Config::default(),
    ));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .rank_thompson(&format!("tenant-{}", i), "chat", "answer", &[openai(), anthropic()])
                    .await
            })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.ranked.len(), 2);
    }
    assert_eq!(service.cache().len().await, 16);
}

#[tokio::test]
async fn test_sla_violation_demotes_provider() {
    let (_, service) = memory_service();
    for candidate in [openai(), anthropic()] {
        for _ in 0..5 {
            service
                .report_call(
                    RoutingStrategy::CostAware,
                    "acme",
                    "chat",
                    "answer",
                    &candidate,
                    &Outcome::new(300.0, 0.002, 80.0, true),
                )
                .await;
        }
    }

    service
        .record_sla_violation(&Provider::Anthropic, "chat")
        .await
        .unwrap();
    let result = service
        .rank_cost_aware("acme", "chat", "answer", &[anthropic(), openai()])
        .await
        .unwrap();
    assert_eq!(result.ranked[0].candidate, openai());
    let demoted = &result.ranked[1];
    assert!((demoted.components.penalty_multiplier - 0.7).abs() < 1e-12);
}

#[tokio::test]
async fn test_budget_hard_limit_forces_cost_saver() {
    let (_, service) = memory_service();
    service
        .set_budget(
            "acme",
            &BudgetConfig {
                monthly_budget: 100.0,
                soft_limit_percentage: 0.8,
                routing_mode: RoutingMode::Performance,
                current_month_usage: 120.0,
            },
        )
        .await
        .unwrap();

    let result = service
        .rank_cost_aware("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert_eq!(result.mode, RoutingMode::CostSaver);
}

#[tokio::test]
async fn test_forecast_hints_reach_cost_aware_but_not_hybrid() {
    let (store, service) = memory_service();
    ForecastStore::upsert(
        store.as_ref(),
        &ForecastState {
            tenant_id: "acme".into(),
            feature: "chat".into(),
            projected_monthly_cost: 95.0,
            burn_rate: 95.0 / 30.0,
            smoothed_monthly_cost: 90.0,
            sla_risk_level: RiskLevel::High,
            performance_drift_score: 0.2,
            degraded_providers: vec![Provider::OpenAi],
            last_updated: Utc::now(),
        },
    )
    .await
    .unwrap();

    let cost_aware = service
        .rank_cost_aware("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert!(cost_aware.diagnostics.forecast_applied);
    let degraded = cost_aware
        .ranked
        .iter()
        .find(|r| r.candidate == openai())
        .unwrap();
    assert!((degraded.components.penalty_multiplier - 0.8).abs() < 1e-12);

    let hybrid = service
        .rank_hybrid("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert!(!hybrid.diagnostics.forecast_applied);
}

#[tokio::test]
async fn test_empty_candidates_rank_to_empty_result() {
    let (_, service) = memory_service();
    for strategy in RoutingStrategy::ALL {
        let result = service.rank(strategy, "acme", "chat", "answer", &[]).await.unwrap();
        assert!(result.ranked.is_empty());
        assert!(result.selected.is_none());
    }
}

/// Store whose every operation fails
struct Unreachable;

fn down<T>() -> Result<T> {
    Err(Error::StoreUnavailable("test", "connection refused".into()))
}

#[async_trait]
impl MetricsStore for Unreachable {
    async fn get(&self, _key: &MetricsKey) -> Result<Option<MetricsRow>> {
        down()
    }

    async fn upsert(&self, _row: &MetricsRow) -> Result<()> {
        down()
    }

    async fn update(&self, _key: &MetricsKey, _apply: RowUpdate<'_>) -> Result<MetricsRow> {
        down()
    }
}

#[async_trait]
impl BudgetStore for Unreachable {
    async fn get(&self, _tenant_id: &str) -> Result<Option<BudgetConfig>> {
        down()
    }

    async fn upsert(&self, _tenant_id: &str, _budget: &BudgetConfig) -> Result<()> {
        down()
    }
}

#[async_trait]
impl PenaltyStore for Unreachable {
    async fn list_active(&self, _feature: &str, _now: DateTime<Utc>) -> Result<Vec<PenaltyRow>> {
        down()
    }

    async fn upsert(&self, _row: &PenaltyRow) -> Result<()> {
        down()
    }
}

#[async_trait]
impl UsageStore for Unreachable {
    async fn record_call(&self, _provider: &Provider, _at: DateTime<Utc>) -> Result<()> {
        down()
    }

    async fn list_24h(&self, _now: DateTime<Utc>) -> Result<Vec<UsageRow>> {
        down()
    }
}

#[tokio::test]
async fn test_side_store_failures_degrade_to_neutral() {
    let backend = Arc::new(MemoryStore::new());
    let mut stores = RoutingStores::from_backend(backend);
    stores.budgets = Arc::new(Unreachable);
    stores.penalties = Arc::new(Unreachable);
    stores.usage = Arc::new(Unreachable);
    let service = RoutingService::new(stores, Config::default())
        .with_random(FixedSequence::new(vec![0.99]));

    let result = service
        .rank_cost_aware("acme", "chat", "answer", &[openai(), anthropic()])
        .await
        .unwrap();
    assert_eq!(result.ranked.len(), 2);
    assert_eq!(result.mode, RoutingMode::Balanced);
    assert!(!result.diagnostics.diversity_triggered);

    let report = service
        .report_call(
            RoutingStrategy::CostAware,
            "acme",
            "chat",
            "answer",
            &openai(),
            &Outcome::new(100.0, 0.001, 80.0, true),
        )
        .await;
    assert!(report.metrics_updated);
    assert!(!report.usage_recorded);
    assert!(report.event_logged);
}

#[tokio::test]
async fn test_metrics_store_failure_is_fatal_to_ranking_only() {
    let backend = Arc::new(MemoryStore::new());
    let mut stores = RoutingStores::from_backend(backend);
    stores.metrics = Arc::new(Unreachable);
    let service = RoutingService::new(stores, Config::default());

    let err = service
        .rank_thompson("acme", "chat", "answer", &[openai()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MetricsUnavailable(..)));
    assert!(err.is_store_failure());

    let report = service
        .report_outcome(
            RoutingStrategy::Thompson,
            MetricsScope::Global,
            "acme",
            "chat",
            "answer",
            &openai(),
            &Outcome::new(100.0, 0.001, 80.0, true),
        )
        .await;
    assert!(!report.metrics_updated);
    assert!(report.rows.is_empty());
    assert!(report.event_logged);
}

#[tokio::test]
async fn test_daily_aggregation_through_service_is_idempotent() {
    let (_, service) = memory_service();
    train(&service, RoutingStrategy::CostAware, 4).await;
    let today = Utc::now().date_naive();

    let first = service.run_daily_aggregation(today).await;
    assert!(first.is_clean());
    assert_eq!(first.cost_rows, 2);
    assert_eq!(first.performance_rows, 2);
    assert_eq!(first.forecast_states, 1);

    let second = service.run_daily_aggregation(today).await;
    assert_eq!(second.cost_rows, first.cost_rows);
    assert_eq!(second.forecast_states, first.forecast_states);

    let state = service.forecast("acme", "chat").await.unwrap().unwrap();
    // 8 calls at 0.002 each
    assert!((state.burn_rate - 0.016).abs() < 1e-9);
    assert_eq!(service.forecasts().await.unwrap().len(), 1);
}
