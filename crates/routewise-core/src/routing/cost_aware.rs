//! Cost-aware multi-objective ranker
//!
//! Five weighted objectives (quality, latency, stability, cost, confidence)
//! with budget-driven weight adjustment, SLA penalties, confidence decay and
//! a diversity guard on the exploration rate.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::blend::{BlendRatio, compute_alpha_beta, compute_epsilon};
use super::ewma::apply_ewma;
use super::guard::{GuardLayer, clamp01, relative_scores};
use super::selection::{epsilon_greedy, sort_ranked};
use super::strategy::{Ranker, RoutingStrategy};
use super::types::{
    CandidateMetrics, Diagnostics, ForecastHints, MetricsKey, MetricsRow, Outcome, Provider,
    RankResult, RankedCandidate, RankingSnapshot, ScoreComponents,
};
use super::weights::{BudgetAdjustment, CostAwareWeights, WeightPolicy};
use crate::forecast::apply_forecast_cost_adjustment;
use crate::random::RandomSource;

/// Score given to an objective with no observations behind it
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Weights after mode lookup, budget interpretation and forecast adjustment
pub(crate) struct ResolvedWeights {
    pub budget: BudgetAdjustment,
    pub weights: CostAwareWeights,
    pub forecast_applied: bool,
}

pub(crate) fn resolve_weights(policy: &WeightPolicy, snapshot: &RankingSnapshot) -> ResolvedWeights {
    let configured_mode = snapshot
        .budget
        .as_ref()
        .map(|b| b.routing_mode)
        .unwrap_or_default();
    let base = policy.weights_for_mode(configured_mode);
    let budget = policy.apply_budget_adjustment(base, snapshot.budget.as_ref());

    match &snapshot.forecast {
        Some(hints) if hints.adjustments.cost_weight_multiplier != 1.0 => ResolvedWeights {
            budget,
            weights: apply_forecast_cost_adjustment(
                budget.weights,
                hints.adjustments.cost_weight_multiplier,
            ),
            forecast_applied: true,
        },
        Some(hints) => ResolvedWeights {
            budget,
            weights: budget.weights,
            forecast_applied: !hints.degraded_providers.is_empty()
                || hints.adjustments.exploration_boost,
        },
        None => ResolvedWeights {
            budget,
            weights: budget.weights,
            forecast_applied: false,
        },
    }
}

/// Forecast provider penalty for one provider, `1.0` when not degraded
pub(crate) fn forecast_penalty(hints: Option<&ForecastHints>, provider: &Provider) -> f64 {
    hints
        .filter(|h| h.degraded_providers.contains(provider))
        .map_or(1.0, |h| h.adjustments.provider_penalty)
}

/// Blend a score across scopes, substituting the neutral score for an absent scope
fn blend_score(ratio: BlendRatio, global: Option<f64>, tenant: Option<f64>) -> f64 {
    ratio.blend(
        global.unwrap_or(NEUTRAL_SCORE),
        tenant.unwrap_or(NEUTRAL_SCORE),
    )
}

/// Blend a raw measurement across scopes; an absent scope defers to the other
fn blend_value(ratio: BlendRatio, global: Option<f64>, tenant: Option<f64>) -> Option<f64> {
    match (global, tenant) {
        (Some(g), Some(t)) => Some(ratio.blend(g, t)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// Batch-normalize optional `(latency, cost)` pairs; missing pairs score neutral
pub(crate) fn relative_or_neutral(values: &[Option<(f64, f64)>]) -> Vec<(f64, f64)> {
    let present: Vec<(f64, f64)> = values.iter().flatten().copied().collect();
    let scores = relative_scores(&present);
    let mut next = 0;
    values
        .iter()
        .map(|v| match v {
            Some(_) => {
                let pair = (scores.latency[next], scores.cost[next]);
                next += 1;
                pair
            }
            None => (NEUTRAL_SCORE, NEUTRAL_SCORE),
        })
        .collect()
}

/// Cost-aware multi-objective ranker
#[derive(Debug, Clone)]
pub struct CostAwareRanker {
    policy: WeightPolicy,
    guard: GuardLayer,
    ewma_smoothing: f64,
}

impl Default for CostAwareRanker {
    fn default() -> Self {
        Self::new(
            WeightPolicy::default(),
            GuardLayer::default(),
            super::ewma::DEFAULT_SMOOTHING,
        )
    }
}

impl CostAwareRanker {
    pub fn new(policy: WeightPolicy, guard: GuardLayer, ewma_smoothing: f64) -> Self {
        Self {
            policy,
            guard,
            ewma_smoothing,
        }
    }

    fn blended_measurements(ratio: BlendRatio, metrics: &CandidateMetrics) -> Option<(f64, f64)> {
        let g = metrics.global_observed();
        let t = metrics.tenant_observed();
        let latency = blend_value(ratio, g.map(|r| r.ewma_latency_ms), t.map(|r| r.ewma_latency_ms))?;
        let cost = blend_value(ratio, g.map(|r| r.ewma_cost_per_1k), t.map(|r| r.ewma_cost_per_1k))?;
        Some((latency, cost))
    }
}

impl Ranker for CostAwareRanker {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::CostAware
    }

    fn rank(&self, snapshot: &RankingSnapshot, rng: &mut dyn RandomSource) -> RankResult {
        let now = snapshot.now;
        let tenant_samples = snapshot.tenant_samples();
        let ratio = compute_alpha_beta(tenant_samples);
        let resolved = resolve_weights(&self.policy, snapshot);
        let weights = resolved.weights;

        let measurements: Vec<Option<(f64, f64)>> = snapshot
            .candidates
            .iter()
            .map(|m| Self::blended_measurements(ratio, m))
            .collect();
        let relative = relative_or_neutral(&measurements);

        let mut ranked: Vec<RankedCandidate> = snapshot
            .candidates
            .iter()
            .zip(relative)
            .map(|(metrics, (latency, cost))| {
                let g = metrics.global_observed();
                let t = metrics.tenant_observed();
                let quality = blend_score(
                    ratio,
                    g.map(|r| clamp01(r.ewma_quality / 100.0)),
                    t.map(|r| clamp01(r.ewma_quality / 100.0)),
                );
                let stability = blend_score(
                    ratio,
                    g.map(|r| clamp01(r.ewma_success_rate)),
                    t.map(|r| clamp01(r.ewma_success_rate)),
                );
                let last_call = metrics.last_call_at();
                let confidence =
                    self.guard
                        .confidence_score(metrics.total_samples(), last_call, now);

                let raw_score = weights.score(quality, latency, stability, cost, confidence);
                let penalty = self.guard.penalty_multiplier(
                    &snapshot.penalties,
                    &metrics.candidate.provider,
                    &snapshot.feature,
                    now,
                ) * forecast_penalty(snapshot.forecast.as_ref(), &metrics.candidate.provider);
                let decay = self.guard.decay_factor(last_call, now);

                RankedCandidate {
                    candidate: metrics.candidate.clone(),
                    score: raw_score * penalty * decay,
                    components: ScoreComponents {
                        quality,
                        latency,
                        stability,
                        cost,
                        confidence,
                        raw_score,
                        penalty_multiplier: penalty,
                        decay_factor: decay,
                    },
                }
            })
            .collect();
        sort_ranked(&mut ranked);

        let diversity = self
            .guard
            .diversity_guard(compute_epsilon(tenant_samples), &snapshot.usage);
        let pick = epsilon_greedy(ranked.len(), diversity.epsilon, rng);
        let selected = pick.map(|(i, _)| ranked[i].candidate.clone());
        let explored = pick.is_some_and(|(_, explored)| explored);

        debug!(
            tenant = %snapshot.tenant_id,
            feature = %snapshot.feature,
            purpose = %snapshot.purpose,
            budget_state = %resolved.budget.state,
            mode = %resolved.budget.effective_mode,
            epsilon = diversity.epsilon,
            diversity_triggered = diversity.triggered,
            selected = ?selected.as_ref().map(|c| c.to_string()),
            explored,
            "Cost-aware ranking complete"
        );

        RankResult {
            strategy: RoutingStrategy::CostAware,
            mode: resolved.budget.effective_mode,
            diagnostics: Diagnostics {
                alpha: ratio.alpha,
                beta: ratio.beta,
                epsilon: diversity.epsilon,
                tenant_samples,
                budget_state: resolved.budget.state,
                weights: Some(weights),
                diversity_triggered: diversity.triggered,
                explored,
                forecast_applied: resolved.forecast_applied,
                top_scores: ranked.iter().take(3).cloned().collect(),
            },
            ranked,
            selected,
        }
    }

    fn apply_outcome(
        &self,
        existing: Option<&MetricsRow>,
        key: &MetricsKey,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> MetricsRow {
        apply_ewma(existing, key, outcome, now, self.ewma_smoothing)
    }
}
