//! Routewise CLI - adaptive provider ranking

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use routewise_core::config::Config;
use routewise_core::routing::{
    BudgetConfig, MetricsScope, Outcome, Provider, ProviderCandidate, RankResult, RoutingMode,
    RoutingService, RoutingStores, RoutingStrategy,
};
use routewise_core::store::SqliteStore;
use tracing::debug;

#[derive(Parser)]
#[command(name = "routewise")]
#[command(author, version, about = "Adaptive provider ranking for multi-provider AI routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum ScopeArg {
    Global,
    Tenant,
    /// Global and tenant rows
    #[default]
    Both,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the database
    Init {
        /// Database file (defaults to routewise.db in the config directory)
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Rank candidate providers for a request
    Rank {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        feature: String,
        #[arg(short, long)]
        purpose: String,
        /// Candidate as provider:model (repeatable)
        #[arg(short, long = "candidate", required = true)]
        candidates: Vec<ProviderCandidate>,
        /// Ranking strategy (defaults to routing.default_strategy)
        #[arg(short, long)]
        strategy: Option<RoutingStrategy>,
    },

    /// Report the outcome of a provider call
    Report {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        feature: String,
        #[arg(short, long)]
        purpose: String,
        /// Provider that served the call, as provider:model
        #[arg(short, long)]
        candidate: ProviderCandidate,
        #[arg(long)]
        latency_ms: f64,
        #[arg(long)]
        cost_per_1k: f64,
        /// Quality score, 0-100
        #[arg(long)]
        quality: f64,
        /// Absolute call cost in USD
        #[arg(long)]
        cost_usd: Option<f64>,
        /// The call failed
        #[arg(long)]
        failed: bool,
        /// Metrics scope to update
        #[arg(long, value_enum, default_value_t = ScopeArg::Both)]
        scope: ScopeArg,
        /// Strategy whose updater applies the outcome
        #[arg(short, long)]
        strategy: Option<RoutingStrategy>,
    },

    /// Penalize a provider after an SLA violation
    SlaViolation {
        #[arg(long)]
        provider: Provider,
        #[arg(short, long)]
        feature: String,
    },

    /// Tenant budget management
    Budget {
        #[command(subcommand)]
        action: BudgetAction,
    },

    /// Aggregate a day's calls and refresh forecasts
    Aggregate {
        /// UTC day as YYYY-MM-DD (defaults to today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Inspect forecasts
    Forecast {
        #[command(subcommand)]
        action: ForecastAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BudgetAction {
    /// Create or replace a tenant's budget
    Set {
        tenant: String,
        #[arg(long)]
        monthly_budget: f64,
        #[arg(long, default_value_t = 0.8)]
        soft_limit: f64,
        #[arg(long, default_value = "balanced")]
        mode: RoutingMode,
        #[arg(long, default_value_t = 0.0)]
        usage: f64,
    },
}

#[derive(Subcommand)]
enum ForecastAction {
    /// Show forecast state, optionally for one tenant/feature
    Show {
        #[arg(short, long)]
        tenant: Option<String>,
        #[arg(short, long, requires = "tenant")]
        feature: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let directive = if cli.quiet {
        "routewise=warn"
    } else {
        "routewise=info"
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match directive.parse() {
        Ok(d) => filter.add_directive(d),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        if let Some(hint) = e
            .downcast_ref::<routewise_core::Error>()
            .and_then(|core| core.suggestion())
        {
            eprintln!("Hint: {}", hint);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let quiet = cli.quiet;

    match cli.command {
        Commands::Init { database } => cmd_init(database, format, quiet).await,

        Commands::Rank {
            tenant,
            feature,
            purpose,
            candidates,
            strategy,
        } => {
            let service = open_service().await?;
            let strategy = strategy.unwrap_or(service.config().routing.default_strategy);
            let result = service
                .rank(strategy, &tenant, &feature, &purpose, &candidates)
                .await?;
            print_ranking(&result, format, quiet)
        }

        Commands::Report {
            tenant,
            feature,
            purpose,
            candidate,
            latency_ms,
            cost_per_1k,
            quality,
            cost_usd,
            failed,
            scope,
            strategy,
        } => {
            let service = open_service().await?;
            let strategy = strategy.unwrap_or(service.config().routing.default_strategy);
            let mut outcome = Outcome::new(latency_ms, cost_per_1k, quality, !failed);
            if let Some(cost) = cost_usd {
                outcome = outcome.with_cost_usd(cost);
            }
            outcome.validate()?;

            let report = match scope {
                ScopeArg::Both => {
                    service
                        .report_call(strategy, &tenant, &feature, &purpose, &candidate, &outcome)
                        .await
                }
                ScopeArg::Global | ScopeArg::Tenant => {
                    let scope = if matches!(scope, ScopeArg::Global) {
                        MetricsScope::Global
                    } else {
                        MetricsScope::Tenant
                    };
                    service
                        .report_outcome(
                            strategy, scope, &tenant, &feature, &purpose, &candidate, &outcome,
                        )
                        .await
                }
            };

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text if !quiet => {
                    println!(
                        "Recorded {} outcome for {} ({} row(s) updated)",
                        if failed { "failed" } else { "successful" },
                        candidate,
                        report.rows.len()
                    );
                    if !report.metrics_updated || !report.usage_recorded || !report.event_logged {
                        println!("Some writes failed; see log output for details.");
                    }
                }
                OutputFormat::Text => {}
            }
            Ok(())
        }

        Commands::SlaViolation { provider, feature } => {
            let service = open_service().await?;
            let row = service.record_sla_violation(&provider, &feature).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&row)?),
                OutputFormat::Text if !quiet => println!(
                    "Penalized {} on {} by {} until {}",
                    row.provider,
                    row.feature,
                    row.penalty_multiplier,
                    row.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                OutputFormat::Text => {}
            }
            Ok(())
        }

        Commands::Budget { action } => {
            let BudgetAction::Set {
                tenant,
                monthly_budget,
                soft_limit,
                mode,
                usage,
            } = action;
            let service = open_service().await?;
            let budget = BudgetConfig {
                monthly_budget,
                soft_limit_percentage: soft_limit,
                routing_mode: mode,
                current_month_usage: usage,
            };
            service.set_budget(&tenant, &budget).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&budget)?),
                OutputFormat::Text if !quiet => println!(
                    "Budget for {}: {:.2}/month, mode {}, {:.2} used",
                    tenant, budget.monthly_budget, budget.routing_mode, budget.current_month_usage
                ),
                OutputFormat::Text => {}
            }
            Ok(())
        }

        Commands::Aggregate { date } => {
            let service = open_service().await?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = service.run_daily_aggregation(date).await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text if !quiet => {
                    println!("Aggregation for {}", report.date);
                    println!("  Cost rows:        {}", report.cost_rows);
                    println!("  Performance rows: {}", report.performance_rows);
                    println!("  Forecast states:  {}", report.forecast_states);
                    println!("  Events pruned:    {}", report.events_pruned);
                    for error in &report.errors {
                        println!("  [!!] {}", error);
                    }
                }
                OutputFormat::Text => {}
            }
            Ok(())
        }

        Commands::Forecast { action } => {
            let ForecastAction::Show { tenant, feature } = action;
            let service = open_service().await?;
            let mut states = service.forecasts().await?;
            if let Some(tenant) = &tenant {
                states.retain(|s| &s.tenant_id == tenant);
            }
            if let Some(feature) = &feature {
                states.retain(|s| &s.feature == feature);
            }

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&states)?),
                OutputFormat::Text if states.is_empty() => {
                    if !quiet {
                        println!("No forecasts yet. Run 'routewise aggregate' first.");
                    }
                }
                OutputFormat::Text => {
                    for s in &states {
                        let degraded: Vec<&str> =
                            s.degraded_providers.iter().map(|p| p.as_str()).collect();
                        println!(
                            "{}/{}: projected {:.2}/month (burn {:.4}/day, smoothed {:.2}), SLA risk {}, drift {:.2}, degraded [{}]",
                            s.tenant_id,
                            s.feature,
                            s.projected_monthly_cost,
                            s.burn_rate,
                            s.smoothed_monthly_cost,
                            s.sla_risk_level,
                            s.performance_drift_score,
                            degraded.join(", ")
                        );
                    }
                }
            }
            Ok(())
        }

        Commands::Config { action } => cmd_config(action, quiet),
    }
}

async fn open_service() -> anyhow::Result<RoutingService> {
    let config = Config::load()?;
    let path = config.database_path()?;
    debug!(path = %path.display(), "Opening routing store");
    let store = Arc::new(SqliteStore::connect(&path).await?);
    Ok(RoutingService::new(RoutingStores::from_backend(store), config))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_init(database: Option<PathBuf>, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config_path = Config::config_path()?;
    let mut config = Config::load()?;
    if database.is_some() {
        config.storage.database_path = database;
    }
    config.save()?;

    let db_path = config.database_path()?;
    let store = SqliteStore::connect(&db_path).await?;
    store.close().await;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "config": config_path.display().to_string(),
                "database": db_path.display().to_string(),
            })
        ),
        OutputFormat::Text if !quiet => {
            println!("Config:   {}", config_path.display());
            println!("Database: {}", db_path.display());
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

fn print_ranking(result: &RankResult, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if quiet {
        if let Some(selected) = &result.selected {
            println!("{}", selected);
        }
        return Ok(());
    }

    println!("Strategy: {}  Mode: {}", result.strategy, result.mode);
    for (i, ranked) in result.ranked.iter().enumerate() {
        let marker = if result.selected.as_ref() == Some(&ranked.candidate) {
            "*"
        } else {
            " "
        };
        println!("{} {}. {:<40} {:.4}", marker, i + 1, ranked.candidate.to_string(), ranked.score);
    }
    let d = &result.diagnostics;
    println!(
        "alpha={:.2} beta={:.2} epsilon={:.3} tenant_samples={} budget={} explored={} diversity={} forecast={}",
        d.alpha,
        d.beta,
        d.epsilon,
        d.tenant_samples,
        d.budget_state,
        d.explored,
        d.diversity_triggered,
        d.forecast_applied
    );
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
