//! SQLite-backed store
//!
//! Every idempotent write is an UPSERT keyed by the row's natural key.
//! Metrics updates run inside a transaction whose first statement is a
//! write, so the database write lock is held across the read-modify-write.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::migrations;
use super::{
    BudgetStore, CallEvent, EventLog, ForecastStore, MetricsStore, PenaltyStore, RowUpdate,
    UsageStore, USAGE_WINDOW_HOURS, hour_bucket, usage_shares,
};
use crate::error::{Error, Result};
use crate::forecast::{DailyCostRow, DailyPerformanceRow, ForecastState, RiskLevel};
use crate::routing::types::{
    BudgetConfig, MetricsKey, MetricsRow, MetricsScope, PenaltyRow, PosteriorState, Provider,
    RoutingMode, UsageRow,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const METRICS_COLUMNS: &str = r#"
    scope, tenant_id, feature, purpose, provider, model,
    ewma_latency_ms, ewma_quality, ewma_cost_per_1k, ewma_success_rate,
    sample_count, cost_ewma, last_call_at,
    ts_alpha, ts_beta, ts_latency_mean, ts_latency_variance, ts_cost_mean, ts_cost_variance
"#;

const UPSERT_METRICS_SQL: &str = r#"
    INSERT INTO provider_metrics (
        scope, tenant_id, feature, purpose, provider, model,
        ewma_latency_ms, ewma_quality, ewma_cost_per_1k, ewma_success_rate,
        sample_count, cost_ewma, last_call_at,
        ts_alpha, ts_beta, ts_latency_mean, ts_latency_variance, ts_cost_mean, ts_cost_variance,
        updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT(scope, tenant_id, feature, purpose, provider, model) DO UPDATE SET
        ewma_latency_ms = excluded.ewma_latency_ms,
        ewma_quality = excluded.ewma_quality,
        ewma_cost_per_1k = excluded.ewma_cost_per_1k,
        ewma_success_rate = excluded.ewma_success_rate,
        sample_count = excluded.sample_count,
        cost_ewma = excluded.cost_ewma,
        last_call_at = excluded.last_call_at,
        ts_alpha = excluded.ts_alpha,
        ts_beta = excluded.ts_beta,
        ts_latency_mean = excluded.ts_latency_mean,
        ts_latency_variance = excluded.ts_latency_variance,
        ts_cost_mean = excluded.ts_cost_mean,
        ts_cost_variance = excluded.ts_cost_variance,
        updated_at = CURRENT_TIMESTAMP
"#;

/// Store implementing every port on one SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool; the schema must already be migrated
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and migrate it
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Private in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Each connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self> {
        migrations::run_migrations(&pool).await?;
        info!("Routing store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn scope_str(scope: MetricsScope) -> &'static str {
    match scope {
        MetricsScope::Global => "global",
        MetricsScope::Tenant => "tenant",
    }
}

fn metrics_from_row(row: &SqliteRow) -> Result<MetricsRow> {
    let scope: String = row.try_get("scope")?;
    let scope: MetricsScope = scope.parse()?;
    let tenant_id: String = row.try_get("tenant_id")?;
    let provider: String = row.try_get("provider")?;

    let ts_alpha: Option<f64> = row.try_get("ts_alpha")?;
    let ts_beta: Option<f64> = row.try_get("ts_beta")?;
    let posterior = match (ts_alpha, ts_beta) {
        (Some(ts_alpha), Some(ts_beta)) => Some(PosteriorState {
            ts_alpha,
            ts_beta,
            ts_latency_mean: row.try_get::<Option<f64>, _>("ts_latency_mean")?.unwrap_or(0.0),
            ts_latency_variance: row
                .try_get::<Option<f64>, _>("ts_latency_variance")?
                .unwrap_or(1.0),
            ts_cost_mean: row.try_get::<Option<f64>, _>("ts_cost_mean")?.unwrap_or(0.0),
            ts_cost_variance: row
                .try_get::<Option<f64>, _>("ts_cost_variance")?
                .unwrap_or(0.0),
        }
        .sanitized()),
        _ => None,
    };

    Ok(MetricsRow {
        key: MetricsKey {
            scope,
            tenant_id: match scope {
                MetricsScope::Global => None,
                MetricsScope::Tenant => Some(tenant_id),
            },
            feature: row.try_get("feature")?,
            purpose: row.try_get("purpose")?,
            provider: Provider::from(provider),
            model: row.try_get("model")?,
        },
        ewma_latency_ms: row.try_get("ewma_latency_ms")?,
        ewma_quality: row.try_get("ewma_quality")?,
        ewma_cost_per_1k: row.try_get("ewma_cost_per_1k")?,
        ewma_success_rate: row.try_get("ewma_success_rate")?,
        sample_count: row.try_get::<i64, _>("sample_count")?.max(0) as u64,
        cost_ewma: row.try_get("cost_ewma")?,
        last_call_at: row.try_get("last_call_at")?,
        posterior,
    })
}

async fn fetch_metrics(conn: &mut SqliteConnection, key: &MetricsKey) -> Result<Option<MetricsRow>> {
    let query = format!(
        "SELECT {} FROM provider_metrics \
         WHERE scope = ? AND tenant_id = ? AND feature = ? AND purpose = ? AND provider = ? AND model = ?",
        METRICS_COLUMNS
    );
    let row = sqlx::query(&query)
        .bind(scope_str(key.scope))
        .bind(key.tenant_column())
        .bind(&key.feature)
        .bind(&key.purpose)
        .bind(key.provider.as_str())
        .bind(&key.model)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(metrics_from_row).transpose()
}

async fn write_metrics(conn: &mut SqliteConnection, row: &MetricsRow) -> Result<()> {
    let posterior = row.posterior;
    sqlx::query(UPSERT_METRICS_SQL)
        .bind(scope_str(row.key.scope))
        .bind(row.key.tenant_column())
        .bind(&row.key.feature)
        .bind(&row.key.purpose)
        .bind(row.key.provider.as_str())
        .bind(&row.key.model)
        .bind(row.ewma_latency_ms)
        .bind(row.ewma_quality)
        .bind(row.ewma_cost_per_1k)
        .bind(row.ewma_success_rate)
        .bind(row.sample_count as i64)
        .bind(row.cost_ewma)
        .bind(row.last_call_at)
        .bind(posterior.map(|p| p.ts_alpha))
        .bind(posterior.map(|p| p.ts_beta))
        .bind(posterior.map(|p| p.ts_latency_mean))
        .bind(posterior.map(|p| p.ts_latency_variance))
        .bind(posterior.map(|p| p.ts_cost_mean))
        .bind(posterior.map(|p| p.ts_cost_variance))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn get(&self, key: &MetricsKey) -> Result<Option<MetricsRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_metrics(&mut conn, key).await
    }

    async fn upsert(&self, row: &MetricsRow) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_metrics(&mut conn, row).await
    }

    async fn update(&self, key: &MetricsKey, apply: RowUpdate<'_>) -> Result<MetricsRow> {
        let mut tx = self.pool.begin().await?;

        // Take the write lock before reading
        sqlx::query(
            "INSERT OR IGNORE INTO provider_metrics \
             (scope, tenant_id, feature, purpose, provider, model) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(scope_str(key.scope))
        .bind(key.tenant_column())
        .bind(&key.feature)
        .bind(&key.purpose)
        .bind(key.provider.as_str())
        .bind(&key.model)
        .execute(&mut *tx)
        .await?;

        let existing = fetch_metrics(&mut tx, key).await?;
        let mut next = apply(existing.as_ref());
        next.key = key.clone();
        write_metrics(&mut tx, &next).await?;
        tx.commit().await?;

        debug!(
            scope = %key.scope,
            provider = %key.provider,
            model = %key.model,
            sample_count = next.sample_count,
            "Updated provider metrics"
        );
        Ok(next)
    }
}

#[async_trait]
impl BudgetStore for SqliteStore {
    async fn get(&self, tenant_id: &str) -> Result<Option<BudgetConfig>> {
        let row = sqlx::query(
            "SELECT monthly_budget, soft_limit_percentage, routing_mode, current_month_usage \
             FROM tenant_budgets WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<BudgetConfig> {
            let mode: String = row.try_get("routing_mode")?;
            Ok(BudgetConfig {
                monthly_budget: row.try_get("monthly_budget")?,
                soft_limit_percentage: row.try_get("soft_limit_percentage")?,
                routing_mode: RoutingMode::parse_or_default(&mode),
                current_month_usage: row.try_get("current_month_usage")?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, tenant_id: &str, budget: &BudgetConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_budgets (
                tenant_id, monthly_budget, soft_limit_percentage, routing_mode,
                current_month_usage, updated_at
            ) VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(tenant_id) DO UPDATE SET
                monthly_budget = excluded.monthly_budget,
                soft_limit_percentage = excluded.soft_limit_percentage,
                routing_mode = excluded.routing_mode,
                current_month_usage = excluded.current_month_usage,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(tenant_id)
        .bind(budget.monthly_budget)
        .bind(budget.soft_limit_percentage)
        .bind(budget.routing_mode.to_string())
        .bind(budget.current_month_usage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PenaltyStore for SqliteStore {
    async fn list_active(&self, feature: &str, now: DateTime<Utc>) -> Result<Vec<PenaltyRow>> {
        let rows = sqlx::query(
            "SELECT provider, feature, penalty_multiplier, expires_at \
             FROM sla_penalties WHERE feature = ? ORDER BY provider",
        )
        .bind(feature)
        .fetch_all(&self.pool)
        .await?;

        let mut active = Vec::with_capacity(rows.len());
        for row in rows {
            let provider: String = row.try_get("provider")?;
            let penalty = PenaltyRow {
                provider: Provider::from(provider),
                feature: row.try_get("feature")?,
                penalty_multiplier: row.try_get("penalty_multiplier")?,
                expires_at: row.try_get("expires_at")?,
            };
            if penalty.is_active(now) {
                active.push(penalty);
            }
        }
        Ok(active)
    }

    async fn upsert(&self, row: &PenaltyRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sla_penalties (provider, feature, penalty_multiplier, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(provider, feature) DO UPDATE SET
                penalty_multiplier = excluded.penalty_multiplier,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(row.provider.as_str())
        .bind(&row.feature)
        .bind(row.penalty_multiplier)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_call(&self, provider: &Provider, at: DateTime<Utc>) -> Result<()> {
        let bucket = hour_bucket(at);
        sqlx::query(
            r#"
            INSERT INTO provider_usage_hourly (hour_bucket, provider, call_count)
            VALUES (?, ?, 1)
            ON CONFLICT(hour_bucket, provider) DO UPDATE SET
                call_count = call_count + 1
            "#,
        )
        .bind(bucket)
        .bind(provider.as_str())
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM provider_usage_hourly WHERE hour_bucket <= ?")
            .bind(bucket - USAGE_WINDOW_HOURS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_24h(&self, now: DateTime<Utc>) -> Result<Vec<UsageRow>> {
        let current = hour_bucket(now);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT provider, SUM(call_count) FROM provider_usage_hourly \
             WHERE hour_bucket > ? AND hour_bucket <= ? GROUP BY provider",
        )
        .bind(current - USAGE_WINDOW_HOURS)
        .bind(current)
        .fetch_all(&self.pool)
        .await?;

        Ok(usage_shares(
            rows.into_iter()
                .map(|(provider, count)| (Provider::from(provider), count.max(0) as u64)),
        ))
    }
}

fn event_from_row(row: &SqliteRow) -> Result<CallEvent> {
    let id: String = row.try_get("id")?;
    let provider: String = row.try_get("provider")?;
    Ok(CallEvent {
        id: id
            .parse()
            .map_err(|e| Error::InvalidInput(format!("bad event id '{}': {}", id, e)))?,
        tenant_id: row.try_get("tenant_id")?,
        feature: row.try_get("feature")?,
        purpose: row.try_get("purpose")?,
        provider: Provider::from(provider),
        model: row.try_get("model")?,
        latency_ms: row.try_get("latency_ms")?,
        cost_usd: row.try_get("cost_usd")?,
        quality: row.try_get("quality")?,
        success: row.try_get("success")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, event: &CallEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO call_events (
                id, tenant_id, feature, purpose, provider, model,
                latency_ms, cost_usd, quality, success, day, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.tenant_id)
        .bind(&event.feature)
        .bind(&event.purpose)
        .bind(event.provider.as_str())
        .bind(&event.model)
        .bind(event.latency_ms)
        .bind(event.cost_usd)
        .bind(event.quality)
        .bind(event.success)
        .bind(event.day())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_day(&self, date: NaiveDate) -> Result<Vec<CallEvent>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, feature, purpose, provider, model, latency_ms, cost_usd, \
             quality, success, created_at FROM call_events WHERE day = ? ORDER BY created_at",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM call_events WHERE day < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn forecast_from_row(row: &SqliteRow) -> Result<ForecastState> {
    let risk: String = row.try_get("sla_risk_level")?;
    let degraded: String = row.try_get("degraded_providers")?;
    let degraded_providers: Vec<Provider> = serde_json::from_str(&degraded)
        .map_err(|e| Error::InvalidInput(format!("bad degraded provider list: {}", e)))?;
    Ok(ForecastState {
        tenant_id: row.try_get("tenant_id")?,
        feature: row.try_get("feature")?,
        projected_monthly_cost: row.try_get("projected_monthly_cost")?,
        burn_rate: row.try_get("burn_rate")?,
        smoothed_monthly_cost: row.try_get("smoothed_monthly_cost")?,
        sla_risk_level: RiskLevel::from_str(&risk)?,
        performance_drift_score: row.try_get("performance_drift_score")?,
        degraded_providers,
        last_updated: row.try_get("last_updated")?,
    })
}

const FORECAST_COLUMNS: &str = "tenant_id, feature, projected_monthly_cost, burn_rate, \
    smoothed_monthly_cost, sla_risk_level, performance_drift_score, degraded_providers, last_updated";

#[async_trait]
impl ForecastStore for SqliteStore {
    async fn get(&self, tenant_id: &str, feature: &str) -> Result<Option<ForecastState>> {
        let query = format!(
            "SELECT {} FROM forecast_state WHERE tenant_id = ? AND feature = ?",
            FORECAST_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(tenant_id)
            .bind(feature)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(forecast_from_row).transpose()
    }

    async fn upsert(&self, state: &ForecastState) -> Result<()> {
        let degraded = serde_json::to_string(&state.degraded_providers)
            .map_err(|e| Error::Other(format!("Failed to encode degraded providers: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO forecast_state (
                tenant_id, feature, projected_monthly_cost, burn_rate, smoothed_monthly_cost,
                sla_risk_level, performance_drift_score, degraded_providers, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, feature) DO UPDATE SET
                projected_monthly_cost = excluded.projected_monthly_cost,
                burn_rate = excluded.burn_rate,
                smoothed_monthly_cost = excluded.smoothed_monthly_cost,
                sla_risk_level = excluded.sla_risk_level,
                performance_drift_score = excluded.performance_drift_score,
                degraded_providers = excluded.degraded_providers,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&state.tenant_id)
        .bind(&state.feature)
        .bind(state.projected_monthly_cost)
        .bind(state.burn_rate)
        .bind(state.smoothed_monthly_cost)
        .bind(state.sla_risk_level.to_string())
        .bind(state.performance_drift_score)
        .bind(degraded)
        .bind(state.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ForecastState>> {
        let query = format!(
            "SELECT {} FROM forecast_state ORDER BY tenant_id, feature",
            FORECAST_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(forecast_from_row).collect()
    }

    async fn upsert_daily_cost(&self, row: &DailyCostRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_costs (date, tenant_id, feature, provider, total_cost_usd, call_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(date, tenant_id, feature, provider) DO UPDATE SET
                total_cost_usd = excluded.total_cost_usd,
                call_count = excluded.call_count
            "#,
        )
        .bind(row.date)
        .bind(&row.tenant_id)
        .bind(&row.feature)
        .bind(row.provider.as_str())
        .bind(row.total_cost_usd)
        .bind(row.call_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_daily_performance(&self, row: &DailyPerformanceRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_performance (date, provider, feature, avg_latency_ms, error_rate, call_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(date, provider, feature) DO UPDATE SET
                avg_latency_ms = excluded.avg_latency_ms,
                error_rate = excluded.error_rate,
                call_count = excluded.call_count
            "#,
        )
        .bind(row.date)
        .bind(row.provider.as_str())
        .bind(&row.feature)
        .bind(row.avg_latency_ms)
        .bind(row.error_rate)
        .bind(row.call_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_costs_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyCostRow>> {
        let rows = sqlx::query(
            "SELECT date, tenant_id, feature, provider, total_cost_usd, call_count \
             FROM daily_costs WHERE date >= ? AND date <= ? ORDER BY date, tenant_id, feature, provider",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let provider: String = row.try_get("provider")?;
                Ok(DailyCostRow {
                    date: row.try_get("date")?,
                    tenant_id: row.try_get("tenant_id")?,
                    feature: row.try_get("feature")?,
                    provider: Provider::from(provider),
                    total_cost_usd: row.try_get("total_cost_usd")?,
                    call_count: row.try_get::<i64, _>("call_count")?.max(0) as u64,
                })
            })
            .collect()
    }

    async fn daily_performance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>> {
        let rows = sqlx::query(
            "SELECT date, provider, feature, avg_latency_ms, error_rate, call_count \
             FROM daily_performance WHERE date >= ? AND date <= ? ORDER BY date, provider, feature",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let provider: String = row.try_get("provider")?;
                Ok(DailyPerformanceRow {
                    date: row.try_get("date")?,
                    provider: Provider::from(provider),
                    feature: row.try_get("feature")?,
                    avg_latency_ms: row.try_get("avg_latency_ms")?,
                    error_rate: row.try_get("error_rate")?,
                    call_count: row.try_get::<i64, _>("call_count")?.max(0) as u64,
                })
            })
            .collect()
    }
}
