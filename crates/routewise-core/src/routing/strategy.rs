//! Routing strategy selection and the common ranker interface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cost_aware::CostAwareRanker;
use super::hybrid::HybridRanker;
use super::thompson::ThompsonRanker;
use super::types::{MetricsKey, MetricsRow, Outcome, RankResult, RankingSnapshot};
use crate::config::Config;
use crate::error::Error;
use crate::random::RandomSource;

/// Which ranker serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Hybrid,
    #[default]
    CostAware,
    Thompson,
}

impl RoutingStrategy {
    pub const ALL: [RoutingStrategy; 3] = [Self::Hybrid, Self::CostAware, Self::Thompson];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::CostAware => "cost_aware",
            Self::Thompson => "thompson",
        }
    }

    /// Build the ranker for this strategy from configuration
    pub fn ranker(&self, config: &Config) -> Box<dyn Ranker> {
        let smoothing = config.routing.ewma_smoothing;
        match self {
            Self::Hybrid => Box::new(HybridRanker::new(smoothing)),
            Self::CostAware => Box::new(CostAwareRanker::new(
                config.weights.clone(),
                config.guard.clone(),
                smoothing,
            )),
            Self::Thompson => Box::new(ThompsonRanker::new(
                config.weights.clone(),
                config.guard.clone(),
                smoothing,
            )),
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "cost_aware" | "cost-aware" => Ok(Self::CostAware),
            "thompson" => Ok(Self::Thompson),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

/// A ranking strategy: scores a snapshot and folds outcomes back into metrics
///
/// Rankers are pure. All I/O happens before `rank` (building the snapshot)
/// and after `apply_outcome` (persisting the returned row).
pub trait Ranker: Send + Sync {
    fn strategy(&self) -> RoutingStrategy;

    /// Score and order the snapshot's candidates and pick one
    fn rank(&self, snapshot: &RankingSnapshot, rng: &mut dyn RandomSource) -> RankResult;

    /// Compute the updated metrics row for one observed outcome
    fn apply_outcome(
        &self,
        existing: Option<&MetricsRow>,
        key: &MetricsKey,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> MetricsRow;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "cost-aware".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::CostAware
        );
        assert_eq!(
            "Thompson".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::Thompson
        );
        assert!(matches!(
            "random".parse::<RoutingStrategy>(),
            Err(Error::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_ranker_mapping() {
        let config = Config::default();
        for strategy in RoutingStrategy::ALL {
            assert_eq!(strategy.ranker(&config).strategy(), strategy);
            assert_eq!(strategy.to_string().parse::<RoutingStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&RoutingStrategy::CostAware).unwrap();
        assert_eq!(json, "\"cost_aware\"");
    }
}
