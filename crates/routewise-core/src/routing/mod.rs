//! Provider ranking and outcome learning
//!
//! Three interchangeable rankers sit behind the [`Ranker`] trait:
//!
//! - **Hybrid**: blends global and tenant EWMA composite scores, with
//!   epsilon-greedy exploration that shrinks as the tenant accumulates data.
//!
//! - **Cost-aware**: five weighted objectives (quality, latency, stability,
//!   cost, confidence) whose weights follow the tenant's routing mode and
//!   budget state, with SLA penalties, confidence decay and a diversity guard.
//!
//! - **Thompson**: samples quality, latency and cost from per-key posteriors
//!   and scores the draws with the same weight policy.
//!
//! Rankers are pure. [`RoutingService`] fetches their inputs from the store
//! ports and persists what they learn.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use routewise_core::prelude::*;
//!
//! let store = Arc::new(SqliteStore::in_memory().await?);
//! let service = RoutingService::new(RoutingStores::from_backend(store), Config::default());
//!
//! let candidates = vec![
//!     ProviderCandidate::new(Provider::OpenAi, "gpt-4o"),
//!     ProviderCandidate::new(Provider::Anthropic, "claude-sonnet"),
//! ];
//! let result = service.rank_cost_aware("acme", "chat", "answer", &candidates).await?;
//!
//! // Call the selected provider, then report what happened
//! if let Some(selected) = &result.selected {
//!     let outcome = Outcome::new(420.0, 0.002, 87.0, true);
//!     service
//!         .report_call(RoutingStrategy::CostAware, "acme", "chat", "answer", selected, &outcome)
//!         .await;
//! }
//! ```

pub mod blend;
pub mod cost_aware;
pub mod ewma;
pub mod guard;
pub mod hybrid;
pub mod sampling;
pub mod selection;
pub mod service;
pub mod strategy;
pub mod thompson;
pub mod types;
pub mod weights;

pub use blend::{BlendRatio, compute_alpha_beta, compute_epsilon};
pub use cost_aware::CostAwareRanker;
pub use guard::GuardLayer;
pub use hybrid::HybridRanker;
pub use service::{OutcomeReport, RoutingService, RoutingStores, ScoreCache};
pub use strategy::{Ranker, RoutingStrategy};
pub use thompson::{ThompsonRanker, compute_posterior_update};
pub use types::{
    BudgetConfig, MetricsKey, MetricsRow, MetricsScope, Outcome, PenaltyRow, Provider,
    ProviderCandidate, RankResult, RankedCandidate, RankingSnapshot, RoutingMode,
};
pub use weights::{BudgetState, CostAwareWeights, WeightPolicy};
