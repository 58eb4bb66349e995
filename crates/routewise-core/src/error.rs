//! Error types for Routewise

use thiserror::Error;

/// Result type alias using Routewise's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Routewise error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (E001-E099)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown provider '{0}'. Expected one of: openai, gemini, anthropic, mistral, or a custom name.")]
    UnknownProvider(String),

    #[error("Unknown routing mode '{0}'. Valid modes: performance, balanced, cost_saver.")]
    UnknownMode(String),

    #[error("Unknown routing strategy '{0}'. Valid strategies: hybrid, cost_aware, thompson.")]
    UnknownStrategy(String),

    // Store errors (E100-E199)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store '{0}' is unavailable: {1}")]
    StoreUnavailable(&'static str, String),

    // Routing errors (E200-E299)
    #[error("Metrics store unreachable while ranking '{0}': {1}")]
    MetricsUnavailable(String, String),

    // Forecast errors (E300-E399)
    #[error("Aggregation failed for {0}: {1}")]
    AggregationFailed(String, String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E001",
            Self::UnknownProvider(_) => "E002",
            Self::UnknownMode(_) => "E003",
            Self::UnknownStrategy(_) => "E004",
            Self::Database(_) => "E100",
            Self::StoreUnavailable(..) => "E101",
            Self::MetricsUnavailable(..) => "E200",
            Self::AggregationFailed(..) => "E300",
            Self::Config(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownStrategy(_) => {
                Some("routewise config set routing.default_strategy hybrid".to_string())
            }
            Self::Database(_) | Self::MetricsUnavailable(..) => {
                Some("routewise init --database <path>".to_string())
            }
            Self::Config(_) => Some("routewise config list".to_string()),
            _ => None,
        }
    }

    /// Whether the failure came from a storage backend rather than bad input
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::StoreUnavailable(..) | Self::MetricsUnavailable(..)
        )
    }
}
