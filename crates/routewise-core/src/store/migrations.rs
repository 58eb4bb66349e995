//! Database migrations
//!
//! Versioned SQLite schema for the routing store, applied on connect.

use sqlx::SqlitePool;

use crate::error::Result;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: routing statistics and ranking inputs
const MIGRATION_V1: &str = r#"
    -- Per-key EWMA statistics with optional Thompson posterior
    CREATE TABLE IF NOT EXISTS provider_metrics (
        scope TEXT NOT NULL CHECK (scope IN ('global', 'tenant')),
        tenant_id TEXT NOT NULL DEFAULT '',
        feature TEXT NOT NULL,
        purpose TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        ewma_latency_ms REAL NOT NULL DEFAULT 0.0,
        ewma_quality REAL NOT NULL DEFAULT 0.0,
        ewma_cost_per_1k REAL NOT NULL DEFAULT 0.0,
        ewma_success_rate REAL NOT NULL DEFAULT 0.0,
        sample_count INTEGER NOT NULL DEFAULT 0,
        cost_ewma REAL NOT NULL DEFAULT 0.0,
        last_call_at TEXT,
        ts_alpha REAL,
        ts_beta REAL,
        ts_latency_mean REAL,
        ts_latency_variance REAL,
        ts_cost_mean REAL,
        ts_cost_variance REAL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (scope, tenant_id, feature, purpose, provider, model)
    );

    CREATE TABLE IF NOT EXISTS tenant_budgets (
        tenant_id TEXT PRIMARY KEY NOT NULL,
        monthly_budget REAL NOT NULL,
        soft_limit_percentage REAL NOT NULL DEFAULT 0.8,
        routing_mode TEXT NOT NULL DEFAULT 'balanced',
        current_month_usage REAL NOT NULL DEFAULT 0.0,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS sla_penalties (
        provider TEXT NOT NULL,
        feature TEXT NOT NULL,
        penalty_multiplier REAL NOT NULL CHECK (penalty_multiplier > 0 AND penalty_multiplier <= 1),
        expires_at TEXT NOT NULL,
        PRIMARY KEY (provider, feature)
    );

    CREATE TABLE IF NOT EXISTS provider_usage_hourly (
        hour_bucket INTEGER NOT NULL,
        provider TEXT NOT NULL,
        call_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (hour_bucket, provider)
    );

    CREATE TABLE IF NOT EXISTS call_events (
        id TEXT PRIMARY KEY NOT NULL,
        tenant_id TEXT NOT NULL,
        feature TEXT NOT NULL,
        purpose TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        latency_ms REAL NOT NULL,
        cost_usd REAL NOT NULL,
        quality REAL NOT NULL,
        success INTEGER NOT NULL,
        day TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_call_events_day ON call_events(day);
"#;

/// Migration 2: daily aggregates and forecast state
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS daily_costs (
        date TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        feature TEXT NOT NULL,
        provider TEXT NOT NULL,
        total_cost_usd REAL NOT NULL DEFAULT 0.0,
        call_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (date, tenant_id, feature, provider)
    );

    CREATE TABLE IF NOT EXISTS daily_performance (
        date TEXT NOT NULL,
        provider TEXT NOT NULL,
        feature TEXT NOT NULL,
        avg_latency_ms REAL NOT NULL DEFAULT 0.0,
        error_rate REAL NOT NULL DEFAULT 0.0,
        call_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (date, provider, feature)
    );

    CREATE TABLE IF NOT EXISTS forecast_state (
        tenant_id TEXT NOT NULL,
        feature TEXT NOT NULL,
        projected_monthly_cost REAL NOT NULL,
        burn_rate REAL NOT NULL,
        smoothed_monthly_cost REAL NOT NULL,
        sla_risk_level TEXT NOT NULL CHECK (sla_risk_level IN ('low', 'medium', 'high')),
        performance_drift_score REAL NOT NULL,
        degraded_providers TEXT NOT NULL DEFAULT '[]',
        last_updated TEXT NOT NULL,
        PRIMARY KEY (tenant_id, feature)
    );
"#;

async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn record_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Routing statistics");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Daily aggregates and forecasts");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Schema version recorded in the database
pub async fn schema_version(pool: &SqlitePool) -> Result<i32> {
    get_current_version(pool).await
}
