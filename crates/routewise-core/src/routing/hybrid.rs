//! Blended EWMA ranker
//!
//! Scores each candidate once from its global row and once from its tenant
//! row, blends the two by the tenant's sample volume, and picks
//! epsilon-greedily among the top three.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::blend::{compute_alpha_beta, compute_epsilon};
use super::ewma::apply_ewma;
use super::selection::{epsilon_greedy, sort_ranked};
use super::strategy::{Ranker, RoutingStrategy};
use super::types::{
    Diagnostics, MetricsKey, MetricsRow, Outcome, RankResult, RankedCandidate, RankingSnapshot,
    ScoreComponents,
};
use super::weights::BudgetState;
use crate::random::RandomSource;

/// Latency at which the latency term bottoms out
pub const LATENCY_CAP_MS: f64 = 5000.0;
/// Cost per 1k tokens at which the cost term bottoms out
pub const COST_CAP_PER_1K: f64 = 0.01;

const W_QUALITY: f64 = 0.40;
const W_SUCCESS: f64 = 0.30;
const W_LATENCY: f64 = 0.20;
const W_COST: f64 = 0.10;

/// Neutral score for a scope without observations
const NEUTRAL: f64 = 0.5;

/// Per-objective terms of one row
#[derive(Debug, Clone, Copy, PartialEq)]
struct RowTerms {
    quality: f64,
    success: f64,
    latency: f64,
    cost: f64,
}

impl RowTerms {
    fn neutral() -> Self {
        Self {
            quality: NEUTRAL,
            success: NEUTRAL,
            latency: NEUTRAL,
            cost: NEUTRAL,
        }
    }

    fn from_row(row: Option<&MetricsRow>) -> Self {
        match row {
            None => Self::neutral(),
            Some(r) => Self {
                quality: (r.ewma_quality / 100.0).clamp(0.0, 1.0),
                success: r.ewma_success_rate.clamp(0.0, 1.0),
                latency: 1.0 - (r.ewma_latency_ms.max(0.0) / LATENCY_CAP_MS).min(1.0),
                cost: 1.0 - (r.ewma_cost_per_1k.max(0.0) / COST_CAP_PER_1K).min(1.0),
            },
        }
    }

    fn score(&self) -> f64 {
        W_QUALITY * self.quality
            + W_SUCCESS * self.success
            + W_LATENCY * self.latency
            + W_COST * self.cost
    }
}

/// Composite score of one metrics row; `0.5` when the row has no observations
pub fn composite_score(row: Option<&MetricsRow>) -> f64 {
    RowTerms::from_row(super::types::observed(row)).score()
}

/// Blended EWMA ranker
#[derive(Debug, Clone)]
pub struct HybridRanker {
    ewma_smoothing: f64,
}

impl Default for HybridRanker {
    fn default() -> Self {
        Self::new(super::ewma::DEFAULT_SMOOTHING)
    }
}

impl HybridRanker {
    pub fn new(ewma_smoothing: f64) -> Self {
        Self { ewma_smoothing }
    }
}

impl Ranker for HybridRanker {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::Hybrid
    }

    fn rank(&self, snapshot: &RankingSnapshot, rng: &mut dyn RandomSource) -> RankResult {
        let tenant_samples = snapshot.tenant_samples();
        let ratio = compute_alpha_beta(tenant_samples);
        let epsilon = compute_epsilon(tenant_samples);

        let mut ranked: Vec<RankedCandidate> = snapshot
            .candidates
            .iter()
            .map(|metrics| {
                let global = RowTerms::from_row(metrics.global_observed());
                let tenant = RowTerms::from_row(metrics.tenant_observed());
                let score = ratio.blend(global.score(), tenant.score());
                RankedCandidate {
                    candidate: metrics.candidate.clone(),
                    score,
                    components: ScoreComponents {
                        quality: ratio.blend(global.quality, tenant.quality),
                        latency: ratio.blend(global.latency, tenant.latency),
                        stability: ratio.blend(global.success, tenant.success),
                        cost: ratio.blend(global.cost, tenant.cost),
                        confidence: 0.0,
                        raw_score: score,
                        penalty_multiplier: 1.0,
                        decay_factor: 1.0,
                    },
                }
            })
            .collect();
        sort_ranked(&mut ranked);

        let pick = epsilon_greedy(ranked.len(), epsilon, rng);
        let selected = pick.map(|(i, _)| ranked[i].candidate.clone());
        let explored = pick.is_some_and(|(_, explored)| explored);

        debug!(
            tenant = %snapshot.tenant_id,
            feature = %snapshot.feature,
            purpose = %snapshot.purpose,
            candidates = ranked.len(),
            selected = ?selected.as_ref().map(|c| c.to_string()),
            explored,
            "Hybrid ranking complete"
        );

        RankResult {
            strategy: RoutingStrategy::Hybrid,
            mode: snapshot
                .budget
                .as_ref()
                .map(|b| b.routing_mode)
                .unwrap_or_default(),
            diagnostics: Diagnostics {
                alpha: ratio.alpha,
                beta: ratio.beta,
                epsilon,
                tenant_samples,
                budget_state: BudgetState::NoConfig,
                weights: None,
                diversity_triggered: false,
                explored,
                forecast_applied: false,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{FixedSequence, SeededRandom};
    use crate::routing::types::{CandidateMetrics, Provider, ProviderCandidate};

    fn row(
        candidate: &ProviderCandidate,
        latency: f64,
        quality: f64,
        cost: f64,
        success: f64,
        samples: u64,
    ) -> MetricsRow {
        let mut row = MetricsRow::empty(MetricsKey::global("chat", "answer", candidate));
        row.ewma_latency_ms = latency;
        row.ewma_quality = quality;
        row.ewma_cost_per_1k = cost;
        row.ewma_success_rate = success;
        row.sample_count = samples;
        row.last_call_at = Some(Utc::now());
        row
    }

    #[test]
    fn test_composite_score_neutral_when_absent() {
        assert_eq!(composite_score(None), 0.5);
    }

    #[test]
    fn test_composite_score_formula() {
        let c = ProviderCandidate::new(Provider::OpenAi, "gpt-4o");
        let r = row(&c, 2500.0, 80.0, 0.005, 0.9, 10);
        let expected = 0.40 * 0.8 + 0.30 * 0.9 + 0.20 * 0.5 + 0.10 * 0.5;
        assert!((composite_score(Some(&r)) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_better_global_row_ranks_first() {
        let good = ProviderCandidate::new(Provider::Anthropic, "claude");
        let poor = ProviderCandidate::new(Provider::Gemini, "flash");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![
                CandidateMetrics::new(poor.clone())
                    .with_global(row(&poor, 4000.0, 40.0, 0.008, 0.7, 50)),
                CandidateMetrics::new(good.clone())
                    .with_global(row(&good, 800.0, 92.0, 0.002, 0.99, 50)),
            ],
            Utc::now(),
        );
        let mut rng = FixedSequence::new(vec![0.99]);
        let result = HybridRanker::default().rank(&snapshot, &mut rng);
        assert_eq!(result.ranked[0].candidate, good);
        assert_eq!(result.selected, Some(good));
        assert!(!result.diagnostics.explored);
        assert_eq!(result.diagnostics.alpha, 0.85);
    }

    #[test]
    fn test_ties_resolve_by_input_order() {
        let a = ProviderCandidate::new(Provider::OpenAi, "a");
        let b = ProviderCandidate::new(Provider::OpenAi, "b");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![CandidateMetrics::new(a.clone()), CandidateMetrics::new(b)],
            Utc::now(),
        );
        let mut rng = FixedSequence::new(vec![0.99]);
        let result = HybridRanker::default().rank(&snapshot, &mut rng);
        assert_eq!(result.selected, Some(a));
    }

    #[test]
    fn test_empty_candidates() {
        let snapshot = RankingSnapshot::new("t1", "chat", "answer", Vec::new(), Utc::now());
        let mut rng = SeededRandom::from_seed(1);
        let result = HybridRanker::default().rank(&snapshot, &mut rng);
        assert!(result.ranked.is_empty());
        assert!(result.selected.is_none());
    }

    #[test]
    fn test_tenant_data_dominates_with_volume() {
        let a = ProviderCandidate::new(Provider::OpenAi, "a");
        let b = ProviderCandidate::new(Provider::Gemini, "b");
        let mut tenant_a = row(&a, 3000.0, 30.0, 0.009, 0.5, 150);
        tenant_a.key = MetricsKey::tenant("t1", "chat", "answer", &a);
        let mut tenant_b = row(&b, 500.0, 95.0, 0.001, 1.0, 150);
        tenant_b.key = MetricsKey::tenant("t1", "chat", "answer", &b);

        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![
                CandidateMetrics::new(a.clone())
                    .with_global(row(&a, 500.0, 95.0, 0.001, 1.0, 1000))
                    .with_tenant(tenant_a),
                CandidateMetrics::new(b.clone())
                    .with_global(row(&b, 3000.0, 30.0, 0.009, 0.5, 1000))
                    .with_tenant(tenant_b),
            ],
            Utc::now(),
        );
        let mut rng = FixedSequence::new(vec![0.99]);
        let result = HybridRanker::default().rank(&snapshot, &mut rng);
        assert_eq!(result.diagnostics.beta, 0.65);
        assert_eq!(result.ranked[0].candidate, b);
    }
}
