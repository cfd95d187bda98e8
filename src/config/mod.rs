//! Configuration Module
//!
//! Provides TOML-based configuration for qbridge with support for:
//! - Connection descriptors for both brokers
//! - Queue mappings per forwarding direction
//! - Route supervision (backoff, shutdown timeout)
//! - Environment variable overrides (QBRIDGE__* prefix)

use std::collections::BTreeSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerId;

pub use broker::{
    BrokerConfig, BrokerKind, ForwarderConfig, PayloadMode, QueueMapping, SupervisionConfig,
};

mod broker;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid env substitution regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker A (consumed by `a_to_b` routes, produced to by `b_to_a`)
    pub broker_a: BrokerConfig,
    /// Broker B
    pub broker_b: BrokerConfig,
    /// Queue mappings
    pub forwarder: ForwarderConfig,
    /// Route supervision
    pub supervision: SupervisionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            broker_a: BrokerConfig::named("broker-a"),
            broker_b: BrokerConfig::named("broker-b"),
            forwarder: ForwarderConfig::default(),
            supervision: SupervisionConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `QBRIDGE__` prefix with double underscores for nesting:
    ///    - `QBRIDGE__BROKER_A__PASSWORD=secret` overrides `broker_a.password`
    ///    - `QBRIDGE__SUPERVISION__MAX_BACKOFF=5m` overrides `supervision.max_backoff`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker_a.name", "broker-a")?
            .set_default("broker_b.name", "broker-b")?
            .set_default("forwarder.payload", "text")?
            .set_default("supervision.initial_backoff", "1s")?
            .set_default("supervision.max_backoff", "60s")?
            .set_default("supervision.shutdown_timeout", "30s")?
            .set_default("supervision.status_interval", "60s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("QBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for broker in [&self.broker_a, &self.broker_b] {
            if broker.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "broker name must not be empty".to_string(),
                ));
            }
            if broker.connect_timeout.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "Broker '{}' has a zero connect_timeout",
                    broker.name
                )));
            }
        }

        if self.broker_a.name == self.broker_b.name {
            return Err(ConfigError::Validation(format!(
                "broker_a and broker_b are both named '{}'",
                self.broker_a.name
            )));
        }

        let supervision = &self.supervision;
        if supervision.initial_backoff.is_zero() {
            return Err(ConfigError::Validation(
                "supervision.initial_backoff must be greater than zero".to_string(),
            ));
        }
        if supervision.initial_backoff > supervision.max_backoff {
            return Err(ConfigError::Validation(
                "supervision.initial_backoff must not exceed supervision.max_backoff".to_string(),
            ));
        }

        // Duplicate sources are rejected when the route table is built
        for mapping in self.forwarder.mappings() {
            if mapping.source_queue.trim().is_empty() || mapping.target_queue.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Queue mapping '{}' -> '{}' has an empty queue name",
                    mapping.source_queue, mapping.target_queue
                )));
            }
        }

        Ok(())
    }

    /// Connection descriptor for `broker`
    pub fn broker(&self, broker: BrokerId) -> &BrokerConfig {
        match broker {
            BrokerId::A => &self.broker_a,
            BrokerId::B => &self.broker_b,
        }
    }

    /// Queues the bridge binds on `broker`, for startup logging
    pub fn queues_on(&self, broker: BrokerId) -> BTreeSet<&str> {
        let (consumed, produced) = match broker {
            BrokerId::A => (&self.forwarder.a_to_b, &self.forwarder.b_to_a),
            BrokerId::B => (&self.forwarder.b_to_a, &self.forwarder.a_to_b),
        };
        consumed
            .iter()
            .map(|m| m.source_queue.as_str())
            .chain(produced.iter().map(|m| m.target_queue.as_str()))
            .collect()
    }
}
