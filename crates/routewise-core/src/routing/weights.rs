//! Objective weights per routing mode and budget-driven adjustment

use serde::{Deserialize, Serialize};

use super::types::{BudgetConfig, RoutingMode};

/// Weights over the five ranking objectives
///
/// Every vector handed out by [`WeightPolicy`] or [`normalize_weights`]
/// sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostAwareWeights {
    pub w_quality: f64,
    pub w_latency: f64,
    pub w_stability: f64,
    pub w_cost: f64,
    pub w_confidence: f64,
}

impl CostAwareWeights {
    pub const PERFORMANCE: Self = Self::new(0.45, 0.20, 0.20, 0.05, 0.10);
    pub const BALANCED: Self = Self::new(0.20, 0.20, 0.20, 0.20, 0.20);
    pub const COST_SAVER: Self = Self::new(0.25, 0.15, 0.10, 0.40, 0.10);

    /// Order: quality, latency, stability, cost, confidence
    pub const fn new(
        w_quality: f64,
        w_latency: f64,
        w_stability: f64,
        w_cost: f64,
        w_confidence: f64,
    ) -> Self {
        Self {
            w_quality,
            w_latency,
            w_stability,
            w_cost,
            w_confidence,
        }
    }

    pub fn sum(&self) -> f64 {
        self.w_quality + self.w_latency + self.w_stability + self.w_cost + self.w_confidence
    }

    /// All components finite and non-negative
    pub fn is_valid(&self) -> bool {
        [
            self.w_quality,
            self.w_latency,
            self.w_stability,
            self.w_cost,
            self.w_confidence,
        ]
        .iter()
        .all(|w| w.is_finite() && *w >= 0.0)
    }

    /// Weighted sum over per-objective scores
    pub fn score(
        &self,
        quality: f64,
        latency: f64,
        stability: f64,
        cost: f64,
        confidence: f64,
    ) -> f64 {
        self.w_quality * quality
            + self.w_latency * latency
            + self.w_stability * stability
            + self.w_cost * cost
            + self.w_confidence * confidence
    }

    /// Copy with `w_cost` scaled, renormalized
    pub fn with_cost_multiplier(&self, multiplier: f64) -> Self {
        normalize_weights(Self {
            w_cost: self.w_cost * multiplier,
            ..*self
        })
    }
}

impl Default for CostAwareWeights {
    fn default() -> Self {
        Self::BALANCED
    }
}

/// Divide each weight by the total; non-positive or invalid totals fall back to balanced
pub fn normalize_weights(weights: CostAwareWeights) -> CostAwareWeights {
    let sum = weights.sum();
    if !weights.is_valid() || !sum.is_finite() || sum <= 0.0 {
        return CostAwareWeights::BALANCED;
    }
    CostAwareWeights {
        w_quality: weights.w_quality / sum,
        w_latency: weights.w_latency / sum,
        w_stability: weights.w_stability / sum,
        w_cost: weights.w_cost / sum,
        w_confidence: weights.w_confidence / sum,
    }
}

/// Where a tenant stands against its monthly budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    UnderLimit,
    SoftLimit,
    HardLimit,
    #[default]
    NoConfig,
}

impl std::fmt::Display for BudgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnderLimit => write!(f, "under_limit"),
            Self::SoftLimit => write!(f, "soft_limit"),
            Self::HardLimit => write!(f, "hard_limit"),
            Self::NoConfig => write!(f, "no_config"),
        }
    }
}

/// Weights after budget interpretation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetAdjustment {
    pub weights: CostAwareWeights,
    pub state: BudgetState,
    pub effective_mode: RoutingMode,
}

/// Mode weight table plus the soft-limit cost boost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightPolicy {
    pub performance: CostAwareWeights,
    pub balanced: CostAwareWeights,
    pub cost_saver: CostAwareWeights,
    /// Multiplier applied to `w_cost` past the soft limit
    pub soft_limit_boost: f64,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self {
            performance: CostAwareWeights::PERFORMANCE,
            balanced: CostAwareWeights::BALANCED,
            cost_saver: CostAwareWeights::COST_SAVER,
            soft_limit_boost: 1.5,
        }
    }
}

impl WeightPolicy {
    /// Normalized weight vector for a routing mode
    pub fn weights_for_mode(&self, mode: RoutingMode) -> CostAwareWeights {
        let weights = match mode {
            RoutingMode::Performance => self.performance,
            RoutingMode::Balanced => self.balanced,
            RoutingMode::CostSaver => self.cost_saver,
        };
        normalize_weights(weights)
    }

    /// Weight vector for a mode name; unknown names use balanced
    pub fn weights_for_mode_name(&self, mode: &str) -> CostAwareWeights {
        self.weights_for_mode(RoutingMode::parse_or_default(mode))
    }

    /// Interpret a budget snapshot against the given weights
    pub fn apply_budget_adjustment(
        &self,
        weights: CostAwareWeights,
        budget: Option<&BudgetConfig>,
    ) -> BudgetAdjustment {
        let Some(budget) = budget else {
            return BudgetAdjustment {
                weights,
                state: BudgetState::NoConfig,
                effective_mode: RoutingMode::Balanced,
            };
        };

        let limit = budget.monthly_budget;
        let usage = budget.current_month_usage;

        if limit > 0.0 && usage >= limit {
            return BudgetAdjustment {
                weights: self.weights_for_mode(RoutingMode::CostSaver),
                state: BudgetState::HardLimit,
                effective_mode: RoutingMode::CostSaver,
            };
        }

        if limit > 0.0 && usage / limit > budget.soft_limit_fraction() {
            return BudgetAdjustment {
                weights: weights.with_cost_multiplier(self.soft_limit_boost),
                state: BudgetState::SoftLimit,
                effective_mode: budget.routing_mode,
            };
        }

        BudgetAdjustment {
            weights,
            state: BudgetState::UnderLimit,
            effective_mode: budget.routing_mode,
        }
    }

    /// Reject negative or non-finite table entries
    pub fn validate(&self) -> Result<(), String> {
        for (name, weights) in [
            ("performance", &self.performance),
            ("balanced", &self.balanced),
            ("cost_saver", &self.cost_saver),
        ] {
            if !weights.is_valid() || weights.sum() <= 0.0 {
                return Err(format!(
                    "weights.{} must be non-negative with a positive sum",
                    name
                ));
            }
        }
        if !self.soft_limit_boost.is_finite() || self.soft_limit_boost <= 0.0 {
            return Err("weights.soft_limit_boost must be positive".to_string());
        }
        Ok(())
    }
}
