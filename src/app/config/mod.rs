//! Application configuration.
//!
//! Loaded from a TOML file, then overridden by the recognized
//! environment knobs (`MAX_AGE_MS`, `MIN_SOURCES`, ...). The feed
//! catalog lives in the same file as `[[feeds]]` tables and can be
//! re-read at runtime.

mod feeds;
mod logging;

pub use feeds::FeedEntry;
pub use logging::{LogFormat, LoggingConfig};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::core::aggregator::AggregatorConfig;
use crate::core::domain::FeedConfig;
use crate::core::exchange::AdapterTuning;
use crate::core::failover::FailoverConfig;
use crate::core::manager::{FreshnessPolicy, ManagerConfig};
use crate::core::validator::ValidatorConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:3101".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: default_listen() }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: i64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: i64,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_historical_window")]
    pub historical_window: usize,
    #[serde(default = "default_cross_source_window_ms")]
    pub cross_source_window_ms: i64,
    #[serde(default = "default_max_failover_ms")]
    pub max_failover_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: i64,
    #[serde(default = "default_weight_update_interval_secs")]
    pub weight_update_interval_secs: u64,
}

fn default_max_age_ms() -> i64 {
    2_000
}
fn default_cache_ttl_ms() -> i64 {
    300
}
fn default_min_sources() -> usize {
    2
}
fn default_outlier_threshold() -> f64 {
    0.12
}
fn default_lambda() -> f64 {
    4e-5
}
fn default_historical_window() -> usize {
    50
}
fn default_cross_source_window_ms() -> i64 {
    10_000
}
fn default_max_failover_ms() -> u64 {
    100
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_threshold() -> u32 {
    5
}
fn default_health_check_interval_ms() -> u64 {
    5_000
}
fn default_min_confidence() -> f64 {
    0.1
}
fn default_max_staleness_ms() -> i64 {
    1_500
}
fn default_weight_update_interval_secs() -> u64 {
    45
}

impl Default for OracleConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty oracle config deserializes")
    }
}

/// Transport tuning shared by all adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}
fn default_rest_timeout_ms() -> u64 {
    5_000
}
fn default_health_timeout_ms() -> u64 {
    2_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_pong_timeout_secs() -> u64 {
    10
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty adapters config deserializes")
    }
}

/// Main application configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
}

impl Config {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment knobs over the file values.
    pub fn apply_env_overrides(&mut self) {
        env_override("MAX_AGE_MS", &mut self.oracle.max_age_ms);
        env_override("CACHE_TTL_MS", &mut self.oracle.cache_ttl_ms);
        env_override("MIN_SOURCES", &mut self.oracle.min_sources);
        env_override("OUTLIER_THRESHOLD", &mut self.oracle.outlier_threshold);
        env_override("LAMBDA", &mut self.oracle.lambda);
        env_override("HISTORICAL_WINDOW", &mut self.oracle.historical_window);
        env_override("CROSS_SOURCE_WINDOW_MS", &mut self.oracle.cross_source_window_ms);
        env_override("MAX_FAILOVER_MS", &mut self.oracle.max_failover_ms);
        env_override("FAILURE_THRESHOLD", &mut self.oracle.failure_threshold);
        env_override("RECOVERY_THRESHOLD", &mut self.oracle.recovery_threshold);
        env_override("HEALTH_CHECK_INTERVAL_MS", &mut self.oracle.health_check_interval_ms);
    }

    fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            return Err(Error::Config("no feeds configured".to_string()));
        }
        if self.oracle.min_sources == 0 {
            return Err(Error::Config("min_sources must be at least 1".to_string()));
        }
        if self.oracle.health_check_interval_ms == 0 {
            return Err(Error::Config("health_check_interval_ms must be positive".to_string()));
        }
        self.catalog().map(|_| ())
    }

    /// Resolve the `[[feeds]]` tables into catalog entries.
    pub fn catalog(&self) -> Result<Vec<FeedConfig>> {
        self.feeds.iter().map(FeedEntry::to_feed_config).collect()
    }

    #[must_use]
    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_age_ms: self.oracle.max_age_ms,
            outlier_threshold: self.oracle.outlier_threshold,
            cross_source_window_ms: self.oracle.cross_source_window_ms,
            ..ValidatorConfig::default()
        }
    }

    #[must_use]
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            min_sources: self.oracle.min_sources,
            max_staleness_ms: self.oracle.max_staleness_ms,
            lambda: self.oracle.lambda,
            outlier_threshold: self.oracle.outlier_threshold,
            cache_ttl_ms: self.oracle.cache_ttl_ms,
        }
    }

    #[must_use]
    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            failure_threshold: self.oracle.failure_threshold,
            recovery_threshold: self.oracle.recovery_threshold,
            max_failover_ms: self.oracle.max_failover_ms,
            health_check_interval_ms: self.oracle.health_check_interval_ms,
        }
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            historical_window: self.oracle.historical_window,
            cross_source_window_ms: self.oracle.cross_source_window_ms,
            policy: FreshnessPolicy {
                fresh_within_ms: self.oracle.max_staleness_ms,
                min_confidence: self.oracle.min_confidence,
            },
            ..ManagerConfig::default()
        }
    }

    #[must_use]
    pub fn adapter_tuning(&self) -> AdapterTuning {
        AdapterTuning {
            max_retries: self.adapters.max_retries,
            base_delay: Duration::from_millis(self.adapters.base_delay_ms),
            connection_timeout: Duration::from_millis(self.adapters.connection_timeout_ms),
            rest_timeout: Duration::from_millis(self.adapters.rest_timeout_ms),
            health_timeout: Duration::from_millis(self.adapters.health_timeout_ms),
            ping_interval: Duration::from_secs(self.adapters.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.adapters.pong_timeout_secs),
        }
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => {
            info!(key, value = %raw, "Environment override applied");
            *slot = value;
        }
        Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::FeedCategory;

    const SAMPLE: &str = r#"
        [server]
        listen = "127.0.0.1:9000"

        [oracle]
        max_age_ms = 1000
        min_sources = 3

        [[feeds]]
        category = "crypto"
        name = "BTC/USD"
        decimals = 6
        sources = [
            { exchange = "binance", symbol = "BTCUSDT" },
            { exchange = "coinbase", symbol = "BTC-USD" },
            { exchange = "kraken", symbol = "XBT/USD", backup = true },
        ]

        [[feeds]]
        category = "crypto"
        name = "ETH/USD"
        sources = [
            { exchange = "binance", symbol = "ETHUSDT" },
            { exchange = "coinbase", symbol = "ETH-USD" },
        ]
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.oracle.max_age_ms, 1_000);
        assert_eq!(config.oracle.min_sources, 3);
        // Untouched knobs keep their built-in defaults.
        assert_eq!(config.oracle.cache_ttl_ms, 300);
        assert_eq!(config.oracle.failure_threshold, 3);

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].feed.category, FeedCategory::Crypto);
        assert_eq!(catalog[0].decimals, 6);
        assert_eq!(catalog[0].backups().len(), 1);
        assert_eq!(catalog[1].decimals, 8);
    }

    #[test]
    fn test_empty_config_uses_builtin_defaults() {
        let oracle = OracleConfig::default();
        assert_eq!(oracle.max_age_ms, 2_000);
        assert_eq!(oracle.cache_ttl_ms, 300);
        assert_eq!(oracle.min_sources, 2);
        assert!((oracle.outlier_threshold - 0.12).abs() < 1e-12);
        assert!((oracle.lambda - 4e-5).abs() < 1e-12);
        assert_eq!(oracle.historical_window, 50);
        assert_eq!(oracle.cross_source_window_ms, 10_000);
        assert_eq!(oracle.max_failover_ms, 100);
        assert_eq!(oracle.failure_threshold, 3);
        assert_eq!(oracle.recovery_threshold, 5);
        assert_eq!(oracle.health_check_interval_ms, 5_000);
    }

    #[test]
    fn test_validation_requires_feeds() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_feed_name_fails_catalog() {
        let raw = r#"
            [[feeds]]
            category = "crypto"
            name = "btcusd"
            sources = [{ exchange = "binance", symbol = "BTCUSDT" }]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.catalog().is_err());
    }
}
