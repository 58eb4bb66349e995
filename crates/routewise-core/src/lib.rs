//! Routewise Core Library
//!
//! This crate provides the core functionality for Routewise, including:
//! - Provider ranking (hybrid EWMA, cost-aware, Thompson sampling)
//! - Outcome learning with global and per-tenant statistics
//! - Budget, SLA penalty, and traffic-diversity guards
//! - Daily cost/performance aggregation and forecasting
//! - Storage ports with in-memory and SQLite backends
//! - File-backed configuration

pub mod config;
pub mod error;
pub mod forecast;
pub mod random;
pub mod routing;
pub mod store;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::random::{RandomSource, SeededRandom};
    pub use crate::routing::{
        Outcome, Provider, ProviderCandidate, RankResult, RoutingService, RoutingStores,
        RoutingStrategy,
    };
    pub use crate::store::{MemoryStore, SqliteStore};
}
