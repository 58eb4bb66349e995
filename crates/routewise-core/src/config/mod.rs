//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::routing::ewma::DEFAULT_SMOOTHING;
use crate::routing::guard::GuardLayer;
use crate::routing::strategy::RoutingStrategy;
use crate::routing::weights::{CostAwareWeights, WeightPolicy};

/// Environment variable overriding the config directory
pub const CONFIG_DIR_ENV: &str = "ROUTEWISE_CONFIG_DIR";

/// Routewise configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing: RoutingConfig,
    pub weights: WeightPolicy,
    pub guard: GuardLayer,
    pub sla: SlaConfig,
    pub forecast: ForecastConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_strategy: RoutingStrategy,
    /// EWMA smoothing factor applied per observation
    pub ewma_smoothing: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::default(),
            ewma_smoothing: DEFAULT_SMOOTHING,
        }
    }
}

/// Penalty applied by `record_sla_violation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub default_penalty_multiplier: f64,
    pub default_penalty_minutes: i64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            default_penalty_multiplier: 0.7,
            default_penalty_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub smoothing_alpha: f64,
    pub burn_window_days: usize,
    /// How far back forecast recomputation looks for cost activity
    pub history_days: i64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.3,
            burn_window_days: 7,
            history_days: 14,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; defaults to `routewise.db` in the config directory
    pub database_path: Option<PathBuf>,
}

const KEYS: &[&str] = &[
    "routing.default_strategy",
    "routing.ewma_smoothing",
    "weights.performance",
    "weights.balanced",
    "weights.cost_saver",
    "weights.soft_limit_boost",
    "guard.diversity_threshold_pct",
    "guard.diversity_epsilon_floor",
    "guard.decay_days",
    "guard.confidence_sample_cap",
    "sla.default_penalty_multiplier",
    "sla.default_penalty_minutes",
    "forecast.smoothing_alpha",
    "forecast.burn_window_days",
    "forecast.history_days",
    "storage.database_path",
];

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

fn format_weights(w: &CostAwareWeights) -> String {
    format!(
        "{}, {}, {}, {}, {}",
        w.w_quality, w.w_latency, w.w_stability, w.w_cost, w.w_confidence
    )
}

/// Parse `quality, latency, stability, cost, confidence`
fn parse_weights(key: &str, value: &str) -> anyhow::Result<CostAwareWeights> {
    let parts = value
        .split(',')
        .map(|p| parse_value::<f64>(key, p))
        .collect::<anyhow::Result<Vec<f64>>>()?;
    let [q, l, s, c, conf] = parts.as_slice() else {
        return Err(anyhow!(
            "{} expects five comma-separated weights (quality, latency, stability, cost, confidence)",
            key
        ));
    };
    Ok(CostAwareWeights::new(*q, *l, *s, *c, *conf))
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("routewise")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Database file to open
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("routewise.db")),
        }
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a file, or defaults if it does not exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.routing.ewma_smoothing) {
            return Err(anyhow!("routing.ewma_smoothing must be between 0.0 and 1.0"));
        }
        self.weights.validate().map_err(|e| anyhow!(e))?;
        self.guard.validate().map_err(|e| anyhow!(e))?;
        let multiplier = self.sla.default_penalty_multiplier;
        if !(multiplier > 0.0 && multiplier <= 1.0) {
            return Err(anyhow!(
                "sla.default_penalty_multiplier must be in (0.0, 1.0]"
            ));
        }
        if self.sla.default_penalty_minutes <= 0 {
            return Err(anyhow!("sla.default_penalty_minutes must be positive"));
        }
        if !(0.0..=1.0).contains(&self.forecast.smoothing_alpha) {
            return Err(anyhow!("forecast.smoothing_alpha must be between 0.0 and 1.0"));
        }
        if self.forecast.burn_window_days == 0 || self.forecast.history_days <= 0 {
            return Err(anyhow!("forecast windows must be positive"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "routing.default_strategy" => self.routing.default_strategy.to_string(),
            "routing.ewma_smoothing" => self.routing.ewma_smoothing.to_string(),

            "weights.performance" => format_weights(&self.weights.performance),
            "weights.balanced" => format_weights(&self.weights.balanced),
            "weights.cost_saver" => format_weights(&self.weights.cost_saver),
            "weights.soft_limit_boost" => self.weights.soft_limit_boost.to_string(),

            "guard.diversity_threshold_pct" => self.guard.diversity_threshold_pct.to_string(),
            "guard.diversity_epsilon_floor" => self.guard.diversity_epsilon_floor.to_string(),
            "guard.decay_days" => self.guard.decay_days.to_string(),
            "guard.confidence_sample_cap" => self.guard.confidence_sample_cap.to_string(),

            "sla.default_penalty_multiplier" => self.sla.default_penalty_multiplier.to_string(),
            "sla.default_penalty_minutes" => self.sla.default_penalty_minutes.to_string(),

            "forecast.smoothing_alpha" => self.forecast.smoothing_alpha.to_string(),
            "forecast.burn_window_days" => self.forecast.burn_window_days.to_string(),
            "forecast.history_days" => self.forecast.history_days.to_string(),

            "storage.database_path" => match &self.storage.database_path {
                Some(path) => path.display().to_string(),
                None => "(default)".to_string(),
            },

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `routewise config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    ///
    /// The change is validated as a whole; an invalid value leaves `self`
    /// untouched.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut next = self.clone();
        match key {
            "routing.default_strategy" => {
                next.routing.default_strategy = value.parse().map_err(|e| anyhow!("{}", e))?;
            }
            "routing.ewma_smoothing" => next.routing.ewma_smoothing = parse_value(key, value)?,

            "weights.performance" => next.weights.performance = parse_weights(key, value)?,
            "weights.balanced" => next.weights.balanced = parse_weights(key, value)?,
            "weights.cost_saver" => next.weights.cost_saver = parse_weights(key, value)?,
            "weights.soft_limit_boost" => next.weights.soft_limit_boost = parse_value(key, value)?,

            "guard.diversity_threshold_pct" => {
                next.guard.diversity_threshold_pct = parse_value(key, value)?
            }
            "guard.diversity_epsilon_floor" => {
                next.guard.diversity_epsilon_floor = parse_value(key, value)?
            }
            "guard.decay_days" => next.guard.decay_days = parse_value(key, value)?,
            "guard.confidence_sample_cap" => {
                next.guard.confidence_sample_cap = parse_value(key, value)?
            }

            "sla.default_penalty_multiplier" => {
                next.sla.default_penalty_multiplier = parse_value(key, value)?
            }
            "sla.default_penalty_minutes" => {
                next.sla.default_penalty_minutes = parse_value(key, value)?
            }

            "forecast.smoothing_alpha" => next.forecast.smoothing_alpha = parse_value(key, value)?,
            "forecast.burn_window_days" => {
                next.forecast.burn_window_days = parse_value(key, value)?
            }
            "forecast.history_days" => next.forecast.history_days = parse_value(key, value)?,

            "storage.database_path" => {
                next.storage.database_path = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value.trim()))
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `routewise config list` to see available keys.",
                    key
                ));
            }
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        Self::reset_at(&Self::config_path()?)
    }

    pub fn reset_at(path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
