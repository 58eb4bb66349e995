//! Types shared by the provider rankers
//!
//! Candidates, metrics rows and posterior state, the read-only snapshots the
//! rankers score against, and the ranked output they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::weights::{BudgetState, CostAwareWeights};
use crate::error::Error;

/// AI model provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Provider {
    OpenAi,
    Gemini,
    Anthropic,
    Mistral,
    /// Any provider without a dedicated variant
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
            Self::Mistral => "mistral",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for Provider {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "gemini" => Self::Gemini,
            "anthropic" => Self::Anthropic,
            "mistral" => Self::Mistral,
            _ => Self::Other(value),
        }
    }
}

impl From<Provider> for String {
    fn from(value: Provider) -> Self {
        value.as_str().to_string()
    }
}

impl std::str::FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::UnknownProvider(s.to_string()));
        }
        Ok(Self::from(trimmed.to_string()))
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider/model pair offered by the caller for one request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub provider: Provider,
    pub model: String,
}

impl ProviderCandidate {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ProviderCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl std::str::FromStr for ProviderCandidate {
    type Err = Error;

    /// Parse `provider:model` or `provider/model`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model) = s
            .split_once(':')
            .or_else(|| s.split_once('/'))
            .ok_or_else(|| {
                Error::InvalidInput(format!("expected provider:model, got '{}'", s))
            })?;
        if model.trim().is_empty() {
            return Err(Error::InvalidInput(format!("missing model in '{}'", s)));
        }
        Ok(Self::new(provider.parse()?, model.trim()))
    }
}

/// Tenant routing mode, selecting a base objective weight vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Performance,
    #[default]
    Balanced,
    CostSaver,
}

impl RoutingMode {
    /// Parse a mode name, falling back to `Balanced` for unknown names
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "balanced" => Ok(Self::Balanced),
            "cost_saver" | "cost-saver" => Ok(Self::CostSaver),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Performance => write!(f, "performance"),
            Self::Balanced => write!(f, "balanced"),
            Self::CostSaver => write!(f, "cost_saver"),
        }
    }
}

/// Statistics scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsScope {
    /// Aggregated across all tenants
    Global,
    /// One tenant's own observations
    Tenant,
}

impl std::fmt::Display for MetricsScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Tenant => write!(f, "tenant"),
        }
    }
}

impl std::str::FromStr for MetricsScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "tenant" => Ok(Self::Tenant),
            _ => Err(Error::InvalidInput(format!("unknown scope '{}'", s))),
        }
    }
}

/// Identity of one metrics row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricsKey {
    pub scope: MetricsScope,
    /// Present only for tenant scope
    pub tenant_id: Option<String>,
    pub feature: String,
    pub purpose: String,
    pub provider: Provider,
    pub model: String,
}

impl MetricsKey {
    pub fn global(feature: &str, purpose: &str, candidate: &ProviderCandidate) -> Self {
        Self {
            scope: MetricsScope::Global,
            tenant_id: None,
            feature: feature.to_string(),
            purpose: purpose.to_string(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
        }
    }

    pub fn tenant(
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
    ) -> Self {
        Self {
            scope: MetricsScope::Tenant,
            tenant_id: Some(tenant_id.to_string()),
            feature: feature.to_string(),
            purpose: purpose.to_string(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
        }
    }

    /// Build a key for an explicit scope; the tenant id is dropped for global scope
    pub fn for_scope(
        scope: MetricsScope,
        tenant_id: &str,
        feature: &str,
        purpose: &str,
        candidate: &ProviderCandidate,
    ) -> Self {
        match scope {
            MetricsScope::Global => Self::global(feature, purpose, candidate),
            MetricsScope::Tenant => Self::tenant(tenant_id, feature, purpose, candidate),
        }
    }

    /// Tenant id as stored (empty string for global rows)
    pub fn tenant_column(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("")
    }
}

/// Minimum Beta shape parameter kept in stored posteriors
pub const MIN_SHAPE: f64 = 0.001;
/// Variance floor for the latency posterior (ms²)
pub const LATENCY_VARIANCE_FLOOR: f64 = 0.01;
/// Variance floor for the cost posterior
pub const COST_VARIANCE_FLOOR: f64 = 0.0001;

/// Bayesian posterior carried by metrics rows used with Thompson sampling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorState {
    pub ts_alpha: f64,
    pub ts_beta: f64,
    pub ts_latency_mean: f64,
    pub ts_latency_variance: f64,
    pub ts_cost_mean: f64,
    pub ts_cost_variance: f64,
}

impl PosteriorState {
    /// Posterior after a single observation
    pub fn first_observation(success: bool, latency_ms: f64, cost_per_1k: f64) -> Self {
        let (ts_alpha, ts_beta) = if success { (2.0, 1.0) } else { (1.0, 2.0) };
        Self {
            ts_alpha,
            ts_beta,
            ts_latency_mean: latency_ms,
            ts_latency_variance: 1.0,
            ts_cost_mean: cost_per_1k,
            ts_cost_variance: COST_VARIANCE_FLOOR,
        }
    }

    /// Clamp shapes and variances back into the sampling domain
    pub fn sanitized(mut self) -> Self {
        self.ts_alpha = finite_or(self.ts_alpha, 1.0).max(MIN_SHAPE);
        self.ts_beta = finite_or(self.ts_beta, 1.0).max(MIN_SHAPE);
        self.ts_latency_mean = finite_or(self.ts_latency_mean, 0.0);
        self.ts_cost_mean = finite_or(self.ts_cost_mean, 0.0);
        self.ts_latency_variance =
            finite_or(self.ts_latency_variance, 1.0).max(LATENCY_VARIANCE_FLOOR);
        self.ts_cost_variance = finite_or(self.ts_cost_variance, COST_VARIANCE_FLOOR)
            .max(COST_VARIANCE_FLOOR);
        self
    }

    /// Mean of the Beta posterior
    pub fn expected_quality(&self) -> f64 {
        self.ts_alpha / (self.ts_alpha + self.ts_beta)
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

/// Per-key statistics row
///
/// A row with `sample_count == 0` carries no observation; scorers treat it
/// exactly like a missing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub key: MetricsKey,
    pub ewma_latency_ms: f64,
    /// Quality on a 0-100 scale
    pub ewma_quality: f64,
    pub ewma_cost_per_1k: f64,
    /// Success rate on a 0-1 scale
    pub ewma_success_rate: f64,
    pub sample_count: u64,
    /// Smoothed absolute cost per call in USD
    pub cost_ewma: f64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub posterior: Option<PosteriorState>,
}

impl MetricsRow {
    /// A row with no observations
    pub fn empty(key: MetricsKey) -> Self {
        Self {
            key,
            ewma_latency_ms: 0.0,
            ewma_quality: 0.0,
            ewma_cost_per_1k: 0.0,
            ewma_success_rate: 0.0,
            sample_count: 0,
            cost_ewma: 0.0,
            last_call_at: None,
            posterior: None,
        }
    }

    pub fn has_observations(&self) -> bool {
        self.sample_count > 0
    }
}

/// Treat zero-sample rows as absent
pub fn observed(row: Option<&MetricsRow>) -> Option<&MetricsRow> {
    row.filter(|r| r.has_observations())
}

/// Observed result of one provider call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub latency_ms: f64,
    pub cost_per_1k: f64,
    /// Quality on a 0-100 scale
    pub quality_avg: f64,
    pub success: bool,
    /// Absolute cost of the call, when known
    pub cost_usd: Option<f64>,
}

impl Outcome {
    pub fn new(latency_ms: f64, cost_per_1k: f64, quality_avg: f64, success: bool) -> Self {
        Self {
            latency_ms,
            cost_per_1k,
            quality_avg,
            success,
            cost_usd: None,
        }
    }

    /// Set the absolute call cost
    pub fn with_cost_usd(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Reject non-finite or negative measurements
    pub fn validate(&self) -> crate::Result<()> {
        let fields = [
            ("latency_ms", self.latency_ms),
            ("cost_per_1k", self.cost_per_1k),
            ("quality_avg", self.quality_avg),
            ("cost_usd", self.cost_usd.unwrap_or(0.0)),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Per-tenant budget snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub monthly_budget: f64,
    /// Fraction of the budget (0-1) past which the soft limit applies;
    /// values above 1 are read as percentages
    pub soft_limit_percentage: f64,
    pub routing_mode: RoutingMode,
    pub current_month_usage: f64,
}

impl BudgetConfig {
    pub fn soft_limit_fraction(&self) -> f64 {
        if self.soft_limit_percentage > 1.0 {
            self.soft_limit_percentage / 100.0
        } else {
            self.soft_limit_percentage
        }
    }
}

/// Time-bounded SLA score dampener for one provider on one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyRow {
    pub provider: Provider,
    pub feature: String,
    /// Multiplier in (0, 1]
    pub penalty_multiplier: f64,
    pub expires_at: DateTime<Utc>,
}

impl PenaltyRow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Trailing 24h traffic share of one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub provider: Provider,
    /// Share of calls in percent (0-100)
    pub usage_percentage: f64,
}

/// Metrics rows for one candidate, both scopes
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMetrics {
    pub candidate: ProviderCandidate,
    pub global: Option<MetricsRow>,
    pub tenant: Option<MetricsRow>,
}

impl CandidateMetrics {
    pub fn new(candidate: ProviderCandidate) -> Self {
        Self {
            candidate,
            global: None,
            tenant: None,
        }
    }

    pub fn with_global(mut self, row: MetricsRow) -> Self {
        self.global = Some(row);
        self
    }

    pub fn with_tenant(mut self, row: MetricsRow) -> Self {
        self.tenant = Some(row);
        self
    }

    /// Observed global row, if any
    pub fn global_observed(&self) -> Option<&MetricsRow> {
        observed(self.global.as_ref())
    }

    /// Observed tenant row, if any
    pub fn tenant_observed(&self) -> Option<&MetricsRow> {
        observed(self.tenant.as_ref())
    }

    pub fn tenant_samples(&self) -> u64 {
        self.tenant_observed().map_or(0, |r| r.sample_count)
    }

    /// Combined samples across scopes
    pub fn total_samples(&self) -> u64 {
        self.tenant_samples() + self.global_observed().map_or(0, |r| r.sample_count)
    }

    /// Most recent observation across scopes
    pub fn last_call_at(&self) -> Option<DateTime<Utc>> {
        let global = self.global_observed().and_then(|r| r.last_call_at);
        let tenant = self.tenant_observed().and_then(|r| r.last_call_at);
        global.max(tenant)
    }
}

/// Forecast-derived adjustments layered onto a ranking call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastHints {
    pub adjustments: crate::forecast::ForecastAdjustments,
    /// Providers the provider penalty applies to
    pub degraded_providers: Vec<Provider>,
}

/// Everything a ranker needs, fetched before scoring starts
#[derive(Debug, Clone)]
pub struct RankingSnapshot {
    pub tenant_id: String,
    pub feature: String,
    pub purpose: String,
    pub candidates: Vec<CandidateMetrics>,
    pub budget: Option<BudgetConfig>,
    pub penalties: Vec<PenaltyRow>,
    pub usage: Vec<UsageRow>,
    pub forecast: Option<ForecastHints>,
    pub now: DateTime<Utc>,
}

impl RankingSnapshot {
    /// Snapshot with no budget, penalties, usage, or forecast data
    pub fn new(
        tenant_id: impl Into<String>,
        feature: impl Into<String>,
        purpose: impl Into<String>,
        candidates: Vec<CandidateMetrics>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            feature: feature.into(),
            purpose: purpose.into(),
            candidates,
            budget: None,
            penalties: Vec::new(),
            usage: Vec::new(),
            forecast: None,
            now,
        }
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_penalties(mut self, penalties: Vec<PenaltyRow>) -> Self {
        self.penalties = penalties;
        self
    }

    pub fn with_usage(mut self, usage: Vec<UsageRow>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_forecast(mut self, hints: ForecastHints) -> Self {
        self.forecast = Some(hints);
        self
    }

    /// Tenant's sample count for this (feature, purpose) across the candidate set
    pub fn tenant_samples(&self) -> u64 {
        self.candidates.iter().map(|c| c.tenant_samples()).sum()
    }
}

/// Per-objective scores behind one candidate's final score
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub quality: f64,
    pub latency: f64,
    pub stability: f64,
    pub cost: f64,
    pub confidence: f64,
    pub raw_score: f64,
    pub penalty_multiplier: f64,
    pub decay_factor: f64,
}

/// One scored candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: ProviderCandidate,
    pub score: f64,
    pub components: ScoreComponents,
}

/// Diagnostic detail attached to every ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub alpha: f64,
    pub beta: f64,
    pub epsilon: f64,
    pub tenant_samples: u64,
    pub budget_state: BudgetState,
    pub weights: Option<CostAwareWeights>,
    pub diversity_triggered: bool,
    /// Selection deviated from rank 1
    pub explored: bool,
    pub forecast_applied: bool,
    /// Top three candidates with their score breakdowns
    pub top_scores: Vec<RankedCandidate>,
}

/// Output of a ranking call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankResult {
    pub strategy: super::strategy::RoutingStrategy,
    pub ranked: Vec<RankedCandidate>,
    pub selected: Option<ProviderCandidate>,
    pub mode: RoutingMode,
    pub diagnostics: Diagnostics,
}
