//! Thompson sampling ranker
//!
//! Each candidate carries a posterior: Beta over success/quality and Gaussians
//! over latency and cost. One draw per objective per candidate feeds the same
//! five-weight formula as the cost-aware ranker, and the best draw wins.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::blend::{BlendRatio, compute_alpha_beta, compute_epsilon};
use super::cost_aware::{forecast_penalty, relative_or_neutral, resolve_weights};
use super::ewma::apply_ewma;
use super::guard::GuardLayer;
use super::sampling::{sample_beta, sample_normal};
use super::selection::{sort_ranked, uniform_top_index};
use super::strategy::{Ranker, RoutingStrategy};
use super::types::{
    COST_VARIANCE_FLOOR, CandidateMetrics, Diagnostics, ForecastHints, LATENCY_VARIANCE_FLOOR,
    MetricsKey, MetricsRow, Outcome, PosteriorState, RankResult, RankedCandidate, RankingSnapshot,
    ScoreComponents, observed,
};
use super::weights::WeightPolicy;
use crate::random::RandomSource;

/// One Welford step over a mean/variance pair where `n` counts the new
/// observation and the stored variance is `M2 / (n - 1)`
fn welford_step(mean: f64, variance: f64, n: f64, x: f64, floor: f64) -> (f64, f64) {
    let m2 = variance * (n - 1.0);
    let delta = x - mean;
    let new_mean = mean + delta / n;
    let delta2 = x - new_mean;
    let new_variance = (m2 + delta * delta2) / n;
    let new_variance = if new_variance.is_finite() {
        new_variance.max(floor)
    } else {
        floor
    };
    (new_mean, new_variance)
}

/// Fold one outcome into a posterior
///
/// `prior_samples` is the number of observations already folded into
/// `existing`; with no prior posterior or no prior samples the first-observation
/// posterior is returned.
pub fn compute_posterior_update(
    existing: Option<&PosteriorState>,
    prior_samples: u64,
    outcome: &Outcome,
) -> PosteriorState {
    let Some(prev) = existing.filter(|_| prior_samples > 0) else {
        return PosteriorState::first_observation(
            outcome.success,
            outcome.latency_ms,
            outcome.cost_per_1k,
        );
    };
    let prev = prev.sanitized();
    let n = (prior_samples + 1) as f64;

    let (ts_latency_mean, ts_latency_variance) = welford_step(
        prev.ts_latency_mean,
        prev.ts_latency_variance,
        n,
        outcome.latency_ms,
        LATENCY_VARIANCE_FLOOR,
    );
    let (ts_cost_mean, ts_cost_variance) = welford_step(
        prev.ts_cost_mean,
        prev.ts_cost_variance,
        n,
        outcome.cost_per_1k,
        COST_VARIANCE_FLOOR,
    );

    PosteriorState {
        ts_alpha: prev.ts_alpha + if outcome.success { 1.0 } else { 0.0 },
        ts_beta: prev.ts_beta + if outcome.success { 0.0 } else { 1.0 },
        ts_latency_mean,
        ts_latency_variance,
        ts_cost_mean,
        ts_cost_variance,
    }
}

fn blend_posteriors(ratio: BlendRatio, g: &PosteriorState, t: &PosteriorState) -> PosteriorState {
    PosteriorState {
        ts_alpha: ratio.blend(g.ts_alpha, t.ts_alpha),
        ts_beta: ratio.blend(g.ts_beta, t.ts_beta),
        ts_latency_mean: ratio.blend(g.ts_latency_mean, t.ts_latency_mean),
        ts_latency_variance: ratio.blend(g.ts_latency_variance, t.ts_latency_variance),
        ts_cost_mean: ratio.blend(g.ts_cost_mean, t.ts_cost_mean),
        ts_cost_variance: ratio.blend(g.ts_cost_variance, t.ts_cost_variance),
    }
}

/// One candidate's posterior draws
struct Draw {
    quality: f64,
    measurements: Option<(f64, f64)>,
}

/// Thompson sampling ranker
#[derive(Debug, Clone)]
pub struct ThompsonRanker {
    policy: WeightPolicy,
    guard: GuardLayer,
    ewma_smoothing: f64,
}

impl Default for ThompsonRanker {
    fn default() -> Self {
        Self::new(
            WeightPolicy::default(),
            GuardLayer::default(),
            super::ewma::DEFAULT_SMOOTHING,
        )
    }
}

impl ThompsonRanker {
    pub fn new(policy: WeightPolicy, guard: GuardLayer, ewma_smoothing: f64) -> Self {
        Self {
            policy,
            guard,
            ewma_smoothing,
        }
    }

    /// Blend the scope posteriors, then apply any forecast shape decay
    fn posterior_for(
        ratio: BlendRatio,
        metrics: &CandidateMetrics,
        hints: Option<&ForecastHints>,
    ) -> Option<PosteriorState> {
        let global = metrics.global_observed().and_then(|r| r.posterior);
        let tenant = metrics.tenant_observed().and_then(|r| r.posterior);
        let mut blended = match (global, tenant) {
            (Some(g), Some(t)) => blend_posteriors(ratio, &g.sanitized(), &t.sanitized()),
            (Some(p), None) | (None, Some(p)) => p,
            (None, None) => return None,
        };
        if let Some(h) = hints.filter(|h| h.adjustments.exploration_boost) {
            blended.ts_alpha *= h.adjustments.ts_alpha_decay;
            blended.ts_beta *= h.adjustments.ts_beta_decay;
        }
        Some(blended.sanitized())
    }

    fn draw(posterior: Option<PosteriorState>, rng: &mut dyn RandomSource) -> Draw {
        match posterior {
            Some(p) => {
                let quality = sample_beta(p.ts_alpha, p.ts_beta, rng);
                let latency = sample_normal(p.ts_latency_mean, p.ts_latency_variance, rng).max(0.0);
                let cost = sample_normal(p.ts_cost_mean, p.ts_cost_variance, rng).max(0.0);
                Draw {
                    quality,
                    measurements: Some((latency, cost)),
                }
            }
            // Uninformative prior on quality, neutral latency and cost
            None => Draw {
                quality: sample_beta(1.0, 1.0, rng),
                measurements: None,
            },
        }
    }
}

impl Ranker for ThompsonRanker {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::Thompson
    }

    fn rank(&self, snapshot: &RankingSnapshot, rng: &mut dyn RandomSource) -> RankResult {
        let now = snapshot.now;
        let tenant_samples = snapshot.tenant_samples();
        let ratio = compute_alpha_beta(tenant_samples);
        let resolved = resolve_weights(&self.policy, snapshot);
        let weights = resolved.weights;
        let hints = snapshot.forecast.as_ref();

        let draws: Vec<Draw> = snapshot
            .candidates
            .iter()
            .map(|m| Self::draw(Self::posterior_for(ratio, m, hints), rng))
            .collect();
        let measurements: Vec<Option<(f64, f64)>> = draws.iter().map(|d| d.measurements).collect();
        let relative = relative_or_neutral(&measurements);

        let mut ranked: Vec<RankedCandidate> = snapshot
            .candidates
            .iter()
            .zip(draws.iter().zip(relative))
            .map(|(metrics, (draw, (latency, cost)))| {
                let quality = draw.quality;
                let last_call = metrics.last_call_at();
                let confidence =
                    self.guard
                        .confidence_score(metrics.total_samples(), last_call, now);
                let raw_score = weights.score(quality, latency, quality, cost, confidence);
                let penalty = self.guard.penalty_multiplier(
                    &snapshot.penalties,
                    &metrics.candidate.provider,
                    &snapshot.feature,
                    now,
                ) * forecast_penalty(hints, &metrics.candidate.provider);
                let decay = self.guard.decay_factor(last_call, now);

                RankedCandidate {
                    candidate: metrics.candidate.clone(),
                    score: raw_score * penalty * decay,
                    components: ScoreComponents {
                        quality,
                        latency,
                        stability: quality,
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
        let index = if ranked.is_empty() {
            None
        } else if diversity.triggered {
            Some(uniform_top_index(ranked.len(), rng))
        } else {
            Some(0)
        };
        let selected = index.map(|i| ranked[i].candidate.clone());
        let explored = index.is_some_and(|i| i != 0);

        debug!(
            tenant = %snapshot.tenant_id,
            feature = %snapshot.feature,
            purpose = %snapshot.purpose,
            budget_state = %resolved.budget.state,
            diversity_triggered = diversity.triggered,
            selected = ?selected.as_ref().map(|c| c.to_string()),
            explored,
            "Thompson ranking complete"
        );

        RankResult {
            strategy: RoutingStrategy::Thompson,
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

    /// EWMA update followed by the posterior update
    fn apply_outcome(
        &self,
        existing: Option<&MetricsRow>,
        key: &MetricsKey,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> MetricsRow {
        let prior = observed(existing).and_then(|r| r.posterior.map(|p| (p, r.sample_count)));
        let mut row = apply_ewma(existing, key, outcome, now, self.ewma_smoothing);
        row.posterior = Some(match prior {
            Some((posterior, samples)) => {
                compute_posterior_update(Some(&posterior), samples, outcome)
            }
            None => compute_posterior_update(None, 0, outcome),
        });
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::ForecastAdjustments;
    use crate::random::SeededRandom;
    use crate::routing::types::{
        BudgetConfig, Provider, ProviderCandidate, RoutingMode, UsageRow,
    };

    fn posterior(alpha: f64, beta: f64, latency: f64, cost: f64) -> PosteriorState {
        PosteriorState {
            ts_alpha: alpha,
            ts_beta: beta,
            ts_latency_mean: latency,
            ts_latency_variance: 100.0,
            ts_cost_mean: cost,
            ts_cost_variance: COST_VARIANCE_FLOOR,
        }
    }

    fn metrics(candidate: &ProviderCandidate, state: PosteriorState, samples: u64) -> CandidateMetrics {
        let mut row = MetricsRow::empty(MetricsKey::global("chat", "answer", candidate));
        row.sample_count = samples;
        row.last_call_at = Some(Utc::now());
        row.posterior = Some(state);
        CandidateMetrics::new(candidate.clone()).with_global(row)
    }

    fn budget(mode: RoutingMode) -> BudgetConfig {
        BudgetConfig {
            monthly_budget: 1000.0,
            soft_limit_percentage: 0.8,
            routing_mode: mode,
            current_month_usage: 0.0,
        }
    }

    #[test]
    fn test_first_update_success_and_failure() {
        let ok = compute_posterior_update(None, 0, &Outcome::new(500.0, 0.002, 90.0, true));
        assert_eq!((ok.ts_alpha, ok.ts_beta), (2.0, 1.0));
        assert_eq!(ok.ts_latency_mean, 500.0);
        assert_eq!(ok.ts_latency_variance, 1.0);
        assert_eq!(ok.ts_cost_variance, COST_VARIANCE_FLOOR);

        let failed = compute_posterior_update(None, 0, &Outcome::new(500.0, 0.002, 0.0, false));
        assert_eq!((failed.ts_alpha, failed.ts_beta), (1.0, 2.0));
    }

    #[test]
    fn test_later_updates_increment_one_shape() {
        let first = compute_posterior_update(None, 0, &Outcome::new(100.0, 0.001, 90.0, true));
        let success = compute_posterior_update(Some(&first), 1, &Outcome::new(100.0, 0.001, 90.0, true));
        assert_eq!(success.ts_alpha, first.ts_alpha + 1.0);
        assert_eq!(success.ts_beta, first.ts_beta);

        let failure = compute_posterior_update(Some(&first), 1, &Outcome::new(100.0, 0.001, 0.0, false));
        assert_eq!(failure.ts_alpha, first.ts_alpha);
        assert_eq!(failure.ts_beta, first.ts_beta + 1.0);
    }

    #[test]
    fn test_welford_mean_and_variance() {
        let first = compute_posterior_update(None, 0, &Outcome::new(100.0, 0.001, 90.0, true));
        let second = compute_posterior_update(Some(&first), 1, &Outcome::new(200.0, 0.001, 90.0, true));
        assert!((second.ts_latency_mean - 150.0).abs() < 1e-9);
        // (1 * 1 + 100 * 50) / 2
        assert!((second.ts_latency_variance - 2500.5).abs() < 1e-9);
        assert_eq!(second.ts_cost_variance, COST_VARIANCE_FLOOR);
    }

    #[test]
    fn test_variance_floor_holds_for_constant_observations() {
        let mut state = compute_posterior_update(None, 0, &Outcome::new(300.0, 0.002, 90.0, true));
        for n in 1..50 {
            state = compute_posterior_update(Some(&state), n, &Outcome::new(300.0, 0.002, 90.0, true));
        }
        assert!(state.ts_latency_variance >= LATENCY_VARIANCE_FLOOR);
        assert!(state.ts_cost_variance >= COST_VARIANCE_FLOOR);
        assert!((state.ts_latency_mean - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_outcome_updates_ewma_and_posterior() {
        let ranker = ThompsonRanker::default();
        let candidate = ProviderCandidate::new(Provider::OpenAi, "gpt-4o");
        let key = MetricsKey::tenant("t1", "chat", "answer", &candidate);
        let now = Utc::now();
        let first = ranker.apply_outcome(None, &key, &Outcome::new(400.0, 0.002, 80.0, true), now);
        assert_eq!(first.sample_count, 1);
        assert_eq!(first.posterior.map(|p| p.ts_alpha), Some(2.0));

        let second = ranker.apply_outcome(Some(&first), &key, &Outcome::new(600.0, 0.002, 60.0, false), now);
        assert_eq!(second.sample_count, 2);
        let p = second.posterior.unwrap();
        assert_eq!((p.ts_alpha, p.ts_beta), (2.0, 2.0));
        assert!((p.ts_latency_mean - 500.0).abs() < 1e-9);
    }

    fn selection_share(mode: RoutingMode, target: &ProviderCandidate, seed: u64) -> usize {
        let cheap = ProviderCandidate::new(Provider::Gemini, "flash");
        let premium = ProviderCandidate::new(Provider::Anthropic, "opus");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![
                metrics(&cheap, posterior(60.0, 40.0, 900.0, 0.0005), 200),
                metrics(&premium, posterior(95.0, 5.0, 1000.0, 0.015), 200),
            ],
            Utc::now(),
        )
        .with_budget(budget(mode));

        let ranker = ThompsonRanker::default();
        let mut rng = SeededRandom::from_seed(seed);
        (0..200)
            .filter(|_| ranker.rank(&snapshot, &mut rng).selected.as_ref() == Some(target))
            .count()
    }

    #[test]
    fn test_cost_saver_favours_cheap_posterior() {
        let cheap = ProviderCandidate::new(Provider::Gemini, "flash");
        let wins = selection_share(RoutingMode::CostSaver, &cheap, 7);
        assert!(wins > 110, "cheap candidate won {} of 200", wins);
    }

    #[test]
    fn test_performance_favours_quality_posterior() {
        let premium = ProviderCandidate::new(Provider::Anthropic, "opus");
        let wins = selection_share(RoutingMode::Performance, &premium, 7);
        assert!(wins > 160, "premium candidate won {} of 200", wins);
    }

    #[test]
    fn test_selection_is_argmax_without_diversity() {
        let a = ProviderCandidate::new(Provider::OpenAi, "a");
        let b = ProviderCandidate::new(Provider::Gemini, "b");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![
                metrics(&a, posterior(5.0, 5.0, 800.0, 0.002), 30),
                metrics(&b, posterior(5.0, 5.0, 800.0, 0.002), 30),
            ],
            Utc::now(),
        );
        let ranker = ThompsonRanker::default();
        let mut rng = SeededRandom::from_seed(3);
        for _ in 0..50 {
            let result = ranker.rank(&snapshot, &mut rng);
            assert_eq!(result.selected.as_ref(), Some(&result.ranked[0].candidate));
            assert!(!result.diagnostics.explored);
        }
    }

    #[test]
    fn test_diversity_override_picks_within_top_three() {
        let candidates: Vec<ProviderCandidate> = (0..5)
            .map(|i| ProviderCandidate::new(Provider::OpenAi, format!("m{}", i)))
            .collect();
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            candidates
                .iter()
                .map(|c| metrics(c, posterior(50.0, 10.0, 700.0, 0.002), 100))
                .collect(),
            Utc::now(),
        )
        .with_usage(vec![UsageRow {
            provider: Provider::OpenAi,
            usage_percentage: 100.0,
        }]);

        let ranker = ThompsonRanker::default();
        let mut rng = SeededRandom::from_seed(21);
        let mut explored = 0;
        for _ in 0..60 {
            let result = ranker.rank(&snapshot, &mut rng);
            assert!(result.diagnostics.diversity_triggered);
            let selected = result.selected.unwrap();
            let position = result.ranked.iter().position(|r| r.candidate == selected).unwrap();
            assert!(position < 3);
            if result.diagnostics.explored {
                explored += 1;
            }
        }
        assert!(explored > 0);
    }

    #[test]
    fn test_negative_samples_clamp_to_zero() {
        let a = ProviderCandidate::new(Provider::OpenAi, "a");
        let b = ProviderCandidate::new(Provider::Gemini, "b");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![
                metrics(&a, posterior(2.0, 2.0, -10_000.0, -5.0), 10),
                metrics(&b, posterior(2.0, 2.0, -10_000.0, -5.0), 10),
            ],
            Utc::now(),
        );
        let mut rng = SeededRandom::from_seed(4);
        let result = ThompsonRanker::default().rank(&snapshot, &mut rng);
        for r in &result.ranked {
            assert_eq!(r.components.latency, 1.0);
            assert_eq!(r.components.cost, 1.0);
            assert!(r.score.is_finite());
        }
    }

    #[test]
    fn test_unobserved_candidates_still_ranked() {
        let fresh = ProviderCandidate::new(Provider::Mistral, "small");
        let snapshot = RankingSnapshot::new(
            "t1",
            "chat",
            "answer",
            vec![CandidateMetrics::new(fresh.clone())],
            Utc::now(),
        );
        let mut rng = SeededRandom::from_seed(5);
        let result = ThompsonRanker::default().rank(&snapshot, &mut rng);
        assert_eq!(result.selected, Some(fresh));
        let c = result.ranked[0].components;
        assert_eq!(c.latency, 0.5);
        assert!((0.0..=1.0).contains(&c.quality));
    }

    #[test]
    fn test_empty_candidates() {
        let snapshot = RankingSnapshot::new("t1", "chat", "answer", Vec::new(), Utc::now());
        let mut rng = SeededRandom::from_seed(6);
        let result = ThompsonRanker::default().rank(&snapshot, &mut rng);
        assert!(result.ranked.is_empty());
        assert!(result.selected.is_none());
    }

    #[test]
    fn test_exploration_boost_decays_shapes() {
        let candidate = ProviderCandidate::new(Provider::OpenAi, "gpt-4o");
        let m = metrics(&candidate, posterior(40.0, 10.0, 500.0, 0.002), 50);
        let ratio = compute_alpha_beta(0);
        let hints = ForecastHints {
            adjustments: ForecastAdjustments {
                cost_weight_multiplier: 1.0,
                provider_penalty: 1.0,
                exploration_boost: true,
                ts_alpha_decay: 0.5,
                ts_beta_decay: 0.5,
            },
            degraded_providers: Vec::new(),
        };

        let plain = ThompsonRanker::posterior_for(ratio, &m, None).unwrap();
        let boosted = ThompsonRanker::posterior_for(ratio, &m, Some(&hints)).unwrap();
        assert_eq!(plain.ts_alpha, 40.0);
        assert_eq!(boosted.ts_alpha, 20.0);
        assert_eq!(boosted.ts_beta, 5.0);
        assert_eq!(plain.expected_quality(), boosted.expected_quality());
    }

    #[test]
    fn test_scope_posteriors_blend() {
        let candidate = ProviderCandidate::new(Provider::OpenAi, "gpt-4o");
        let mut m = metrics(&candidate, posterior(10.0, 10.0, 1000.0, 0.002), 150);
        let mut tenant = MetricsRow::empty(MetricsKey::tenant("t1", "chat", "answer", &candidate));
        tenant.sample_count = 150;
        tenant.posterior = Some(posterior(30.0, 10.0, 500.0, 0.002));
        m.tenant = Some(tenant);

        let ratio = compute_alpha_beta(150);
        let blended = ThompsonRanker::posterior_for(ratio, &m, None).unwrap();
        assert!((blended.ts_alpha - (0.35 * 10.0 + 0.65 * 30.0)).abs() < 1e-9);
        assert!((blended.ts_latency_mean - (0.35 * 1000.0 + 0.65 * 500.0)).abs() < 1e-9);
    }
}
