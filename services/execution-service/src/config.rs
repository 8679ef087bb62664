//! Execution service configuration
//!
//! Loaded from an optional TOML file, then overridden from the environment
//! (a `.env` file is read first when present).

use crate::error::{ServiceError, ServiceResult};
use oms::OmsConfig;
use perf::{AffinityConfig, LatencyConfig, PoolConfig};
use positions::PositionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Store URL override
pub const ENV_STORE_URL: &str = "EXEC_STORE_URL";
/// Latency tracking on/off override
pub const ENV_LATENCY_ENABLED: &str = "EXEC_LATENCY_ENABLED";
/// Worker pinning on/off override
pub const ENV_PIN_WORKERS: &str = "EXEC_PIN_WORKERS";

/// Store URL selecting the in-process backend
pub const MEMORY_STORE_URL: &str = "memory";

const DEFAULT_MONITORING_INTERVAL_MS: u64 = 5_000;

/// Capacities of the internal queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Venue order status reports
    pub order_updates: usize,
    /// Execution reports
    pub fills: usize,
    /// Positions to re-mark after a fill
    pub position_updates: usize,
    /// Market ticks
    pub ticks: usize,
    /// Order book snapshots
    pub books: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            order_updates: 1_000,
            fills: 1_000,
            position_updates: 1_000,
            ticks: 10_000,
            books: 1_000,
        }
    }
}

/// Event store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory` or a SQLite URL such as `sqlite://exec.db?mode=rwc`
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: MEMORY_STORE_URL.to_string(),
        }
    }
}

impl StoreConfig {
    /// True for the in-process backend
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_STORE_URL
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Simulated venues registered by the binary
    pub exchanges: Vec<String>,
    /// Order manager
    pub oms: OmsConfig,
    /// Position tracker
    pub positions: PositionConfig,
    /// Object pools
    pub pools: PoolConfig,
    /// Latency tracker
    pub latency: LatencyConfig,
    /// Core assignment
    pub affinity: AffinityConfig,
    /// Queue capacities
    pub queues: QueueConfig,
    /// Event store
    pub store: StoreConfig,
    /// Run workers on pinned OS threads instead of tokio tasks
    pub pin_workers: bool,
    /// Monitoring task period (milliseconds)
    pub monitoring_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            exchanges: vec!["X".to_string()],
            oms: OmsConfig::default(),
            positions: PositionConfig::default(),
            pools: PoolConfig::default(),
            latency: LatencyConfig::default(),
            affinity: AffinityConfig::default(),
            queues: QueueConfig::default(),
            store: StoreConfig::default(),
            pin_workers: false,
            monitoring_interval_ms: DEFAULT_MONITORING_INTERVAL_MS,
        }
    }
}

impl ServiceConfig {
    /// Read `path` (or defaults), apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> ServiceResult<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ServiceError::config(format!("cannot read {}: {e}", path.display())))?;
                let config = Self::from_toml(&raw)?;
                info!("Loaded configuration from {}", path.display());
                config
            }
            None => {
                info!("No configuration file given, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml(raw: &str) -> ServiceResult<Self> {
        toml::from_str(raw).map_err(|e| ServiceError::config(format!("invalid TOML: {e}")))
    }

    /// Apply `EXEC_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ServiceResult<()> {
        if let Some(url) = lookup(ENV_STORE_URL) {
            debug!("{} overrides store url", ENV_STORE_URL);
            self.store.url = url;
        }
        if let Some(raw) = lookup(ENV_LATENCY_ENABLED) {
            self.latency.enabled = parse_flag(ENV_LATENCY_ENABLED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PIN_WORKERS) {
            self.pin_workers = parse_flag(ENV_PIN_WORKERS, &raw)?;
        }
        Ok(())
    }

    /// Check bounds across every section
    pub fn validate(&self) -> ServiceResult<()> {
        let queues = &self.queues;
        if [
            queues.order_updates,
            queues.fills,
            queues.position_updates,
            queues.ticks,
            queues.books,
        ]
        .contains(&0)
        {
            return Err(ServiceError::config("queue capacities must be positive"));
        }
        self.oms
            .validate()
            .map_err(|e| ServiceError::config(e.to_string()))?;
        self.positions.validate().map_err(ServiceError::config)?;
        if self.store.url.is_empty() {
            return Err(ServiceError::config("store url must not be empty"));
        }
        if self.monitoring_interval_ms == 0 {
            return Err(ServiceError::config("monitoring_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Monitoring task period
    #[must_use]
    pub const fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }
}

fn parse_flag(key: &str, raw: &str) -> ServiceResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ServiceError::config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queues.ticks, 10_000);
        assert!(config.store.is_memory());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> ServiceResult<()> {
        let config = ServiceConfig::from_toml(
            r#"
            exchanges = ["X", "Y"]
            pin_workers = true

            [queues]
            fills = 64

            [oms.retry]
            max_attempts = 5
            "#,
        )?;
        assert_eq!(config.exchanges, vec!["X".to_string(), "Y".to_string()]);
        assert!(config.pin_workers);
        assert_eq!(config.queues.fills, 64);
        assert_eq!(config.queues.ticks, 10_000);
        assert_eq!(config.oms.retry.max_attempts, 5);
        assert_eq!(config.oms.retry.initial_delay_ms, 100);
        Ok(())
    }

    #[test]
    fn test_load_reads_file() -> ServiceResult<()> {
        let dir = tempfile::tempdir().map_err(|e| ServiceError::config(e.to_string()))?;
        let path = dir.path().join("exec.toml");
        std::fs::write(&path, "monitoring_interval_ms = 250\n[queues]\nbooks = 8\n")
            .map_err(|e| ServiceError::config(e.to_string()))?;

        let config = ServiceConfig::load(Some(&path))?;
        assert_eq!(config.monitoring_interval(), Duration::from_millis(250));
        assert_eq!(config.queues.books, 8);
        Ok(())
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ServiceConfig::load(Some(Path::new("/nonexistent/exec.toml")));
        assert!(matches!(result, Err(ServiceError::Configuration { .. })));
    }

    #[test]
    fn test_env_overrides() -> ServiceResult<()> {
        let env: HashMap<&str, &str> = [
            (ENV_STORE_URL, "sqlite::memory:"),
            (ENV_LATENCY_ENABLED, "false"),
            (ENV_PIN_WORKERS, "1"),
        ]
        .into_iter()
        .collect();
        let mut config = ServiceConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))?;
        assert_eq!(config.store.url, "sqlite::memory:");
        assert!(!config.latency.enabled);
        assert!(config.pin_workers);
        Ok(())
    }

    #[test]
    fn test_bad_flag_is_rejected() {
        let mut config = ServiceConfig::default();
        let result = config.apply_overrides(|key| (key == ENV_PIN_WORKERS).then(|| "maybe".to_string()));
        assert!(matches!(result, Err(ServiceError::Configuration { .. })));
    }

    #[rstest]
    #[case::zero_queue(|c: &mut ServiceConfig| c.queues.books = 0)]
    #[case::zero_attempts(|c: &mut ServiceConfig| c.oms.retry.max_attempts = 0)]
    #[case::inverted_delays(|c: &mut ServiceConfig| c.oms.retry.initial_delay_ms = c.oms.retry.max_delay_ms + 1)]
    #[case::margin_above_one(|c: &mut ServiceConfig| c.positions.initial_margin_rate = 1.5)]
    #[case::negative_margin(|c: &mut ServiceConfig| c.positions.maintenance_margin_rate = -0.1)]
    fn test_validation_rejects(#[case] mutate: fn(&mut ServiceConfig)) {
        let mut config = ServiceConfig::default();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ServiceError::Configuration { .. })));
    }
}
