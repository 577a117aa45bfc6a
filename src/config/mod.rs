//! Configuration management for the clipcast engine
//!
//! Configuration loads from a TOML file, from environment variables, or from
//! built-in defaults; environment variables win over the file. Every section
//! maps onto one component's config type.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::{DriverConfig, OrchestratorConfig, ProcessorConfig};
use crate::health::HealthConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine driver and batch settings
    pub engine: EngineSection,

    /// Circuit-breaker thresholds
    pub health: HealthSection,

    /// Database configuration
    pub database: DatabaseSection,

    /// Notification configuration
    pub notifications: NotificationSection,

    /// Logging configuration
    pub logging: LoggingSection,
}

/// Driver, orchestrator, and processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub orchestrator_interval_secs: u64,
    pub processor_interval_secs: u64,
    pub slot_lookback_minutes: i64,
    pub batch_size: usize,
    pub max_concurrent_publishes: usize,
    pub stagger_secs: u64,
    pub publish_timeout_secs: u64,
    pub metadata_timeout_secs: u64,
    pub max_attempts: u32,
    pub stale_after_minutes: i64,
    pub rate_limit_per_minute: u32,
}

impl Default for EngineSection {
    fn default() -> Self {
        let driver = DriverConfig::default();
        let orchestrator = OrchestratorConfig::default();
        let processor = ProcessorConfig::default();
        Self {
            orchestrator_interval_secs: driver.orchestrator_interval_secs,
            processor_interval_secs: driver.processor_interval_secs,
            slot_lookback_minutes: orchestrator.slot_lookback_minutes,
            batch_size: processor.batch_size,
            max_concurrent_publishes: processor.max_concurrent,
            stagger_secs: processor.stagger_secs,
            publish_timeout_secs: processor.publish_timeout_secs,
            metadata_timeout_secs: processor.metadata_timeout_secs,
            max_attempts: processor.max_attempts,
            stale_after_minutes: processor.stale_after_minutes,
            rate_limit_per_minute: processor.rate_limit_per_minute,
        }
    }
}

/// Circuit-breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub failure_threshold: u32,
    pub cooldown_secs: i64,
}

impl Default for HealthSection {
    fn default() -> Self {
        let health = HealthConfig::default();
        Self {
            failure_threshold: health.failure_threshold,
            cooldown_secs: health.cooldown_secs,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/clipcast.db"),
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    /// Webhook endpoint for engine events; disabled when unset
    pub webhook_url: Option<String>,

    /// Webhook request timeout in seconds
    pub webhook_timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut config: Config = toml::from_str(&raw).context("parsing config file")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(path) = env_var("CLIPCAST_SQLITE_PATH") {
            self.database.sqlite_path = path.into();
        }
        if let Some(url) = env_var("CLIPCAST_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(level) = env_var("CLIPCAST_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("CLIPCAST_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(v) = env_parse("CLIPCAST_BATCH_SIZE") {
            self.engine.batch_size = v;
        }
        if let Some(v) = env_parse("CLIPCAST_MAX_CONCURRENT") {
            self.engine.max_concurrent_publishes = v;
        }
        if let Some(v) = env_parse("CLIPCAST_MAX_ATTEMPTS") {
            self.engine.max_attempts = v;
        }
        if let Some(v) = env_parse("CLIPCAST_FAILURE_THRESHOLD") {
            self.health.failure_threshold = v;
        }
        if let Some(v) = env_parse("CLIPCAST_COOLDOWN_SECS") {
            self.health.cooldown_secs = v;
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.batch_size == 0 {
            anyhow::bail!("engine.batch_size must be at least 1");
        }
        if self.engine.max_concurrent_publishes == 0 {
            anyhow::bail!("engine.max_concurrent_publishes must be at least 1");
        }
        if self.engine.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }
        if self.health.failure_threshold == 0 {
            anyhow::bail!("health.failure_threshold must be at least 1");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            );
        }
        Ok(())
    }

    /// Component config for the orchestrator
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            slot_lookback_minutes: self.engine.slot_lookback_minutes,
        }
    }

    /// Component config for the processor
    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.engine.batch_size,
            max_concurrent: self.engine.max_concurrent_publishes,
            stagger_secs: self.engine.stagger_secs,
            publish_timeout_secs: self.engine.publish_timeout_secs,
            metadata_timeout_secs: self.engine.metadata_timeout_secs,
            max_attempts: self.engine.max_attempts,
            stale_after_minutes: self.engine.stale_after_minutes,
            rate_limit_per_minute: self.engine.rate_limit_per_minute,
        }
    }

    /// Component config for the drivers
    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            orchestrator_interval_secs: self.engine.orchestrator_interval_secs,
            processor_interval_secs: self.engine.processor_interval_secs,
        }
    }

    /// Component config for the health monitor
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.health.failure_threshold,
            cooldown_secs: self.health.cooldown_secs,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.cooldown_secs, 30 * 60);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            [engine]
            batch_size = 25
            max_attempts = 5

            [health]
            failure_threshold = 3

            [database]
            sqlite_path = "/tmp/test.db"

            [logging]
            level = "debug"
            format = "json"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();
        assert_eq!(config.engine.batch_size, 25);
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.health.failure_threshold, 3);
        // Unspecified fields keep their defaults
        assert_eq!(config.engine.max_concurrent_publishes, 3);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.engine.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_component_configs_derived() {
        let mut config = Config::default();
        config.engine.max_attempts = 7;
        config.health.cooldown_secs = 120;

        assert_eq!(config.processor().max_attempts, 7);
        assert_eq!(config.health_config().cooldown_secs, 120);
        assert_eq!(config.driver().processor_interval_secs, 30);
    }
}
