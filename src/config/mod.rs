//! Configuration Module
//!
//! Provides TOML-based configuration for evokmq with support for:
//! - Evok feed connection
//! - MQTT broker connection
//! - Topic namespace and payloads
//! - Reconnect backoff
//! - Home Assistant discovery
//! - Point list
//! - Environment variable overrides (EVOKMQ__* prefix)

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{BridgeConfig, DiscoveryConfig};
pub use bus::BusConfig;
pub use feed::FeedConfig;
pub use point::PointConfig;

mod bridge;
mod bus;
mod feed;
mod point;

use crate::backoff::ReconnectPolicy;
use crate::bus::{qos_from_level, MqttSettings};
use crate::discovery::Discovery;
use crate::engine::EngineConfig;
use crate::topic::{validate_topic_level, validate_topic_name, Payloads, TopicMapper};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
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
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Evok feed connection
    pub feed: FeedConfig,
    /// MQTT broker connection
    pub bus: BusConfig,
    /// Topic namespace and shutdown behavior
    pub bridge: BridgeConfig,
    /// Reconnect backoff, shared by feed and bus
    pub reconnect: ReconnectPolicy,
    /// Home Assistant discovery
    pub discovery: DiscoveryConfig,
    /// Bridged points (`[[point]]` tables)
    #[serde(rename = "point")]
    pub points: Vec<PointConfig>,
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
    /// 2. Override via env vars: `EVOKMQ__` prefix with double underscores for nesting:
    ///    - `EVOKMQ__FEED__URL=ws://unipi/ws` overrides `feed.url`
    ///    - `EVOKMQ__BUS__PORT=8883` overrides `bus.port`
    ///    - `EVOKMQ__DISCOVERY__ENABLED=false` overrides `discovery.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("feed.url", feed::DEFAULT_URL)?
            .set_default("feed.connect_timeout", "10s")?
            .set_default("bus.host", "localhost")?
            .set_default("bus.port", 1883)?
            .set_default("bus.keep_alive", "30s")?
            .set_default("bus.connect_timeout", "10s")?
            .set_default("bus.qos", 1)?
            .set_default("bus.max_pending", 1000)?
            .set_default("bridge.payload_on", "ON")?
            .set_default("bridge.payload_off", "OFF")?
            .set_default("bridge.drain_grace", "5s")?
            .set_default("reconnect.initial_delay", "1s")?
            .set_default("reconnect.max_delay", "30s")?
            .set_default("discovery.enabled", true)?
            .set_default("discovery.prefix", crate::discovery::DEFAULT_DISCOVERY_PREFIX)?;

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

        // Override with environment variables (EVOKMQ__BUS__HOST, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("EVOKMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.points.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[point]] must be configured".to_string(),
            ));
        }

        self.feed.validate()?;
        self.bus.validate()?;

        if self.reconnect.initial_delay.is_zero() {
            return Err(ConfigError::Validation(
                "reconnect.initial_delay must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(ConfigError::Validation(
                "reconnect.max_delay must not be less than reconnect.initial_delay".to_string(),
            ));
        }

        for point in &self.points {
            if let Some(component) = point.component {
                if !component.supports(point.dev) {
                    return Err(ConfigError::Validation(format!(
                        "point {} {} cannot be announced as {}",
                        point.dev,
                        point.circuit,
                        component.as_str()
                    )));
                }
            }
        }

        if self.discovery.enabled {
            validate_topic_name(&self.discovery.prefix).map_err(|e| {
                ConfigError::Validation(format!("discovery.prefix: {}", e))
            })?;
            validate_topic_level(&self.bridge.node())
                .map_err(|e| ConfigError::Validation(format!("bridge.node: {}", e)))?;
        }

        // Point ids, prefix and payloads are checked by building the mapper
        self.mapper()?;
        Ok(())
    }

    /// Build the topic mapper for the configured points
    pub fn mapper(&self) -> Result<TopicMapper, ConfigError> {
        let payloads = Payloads {
            on: self.bridge.payload_on.clone(),
            off: self.bridge.payload_off.clone(),
        };
        let points = self.points.iter().map(PointConfig::to_point).collect();
        TopicMapper::new(self.bridge.topic_prefix(), payloads, points)
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Settings for the MQTT connector
    pub fn mqtt_settings(&self) -> Result<MqttSettings, ConfigError> {
        let qos = qos_from_level(self.bus.qos).ok_or_else(|| {
            ConfigError::Validation("bus.qos must be 0, 1, or 2".to_string())
        })?;
        let client_id = self
            .bus
            .client_id
            .clone()
            .unwrap_or_else(|| format!("evokmq-{}", self.bridge.node()));

        let mut settings = MqttSettings::new(self.bus.host.clone(), self.bus.port, client_id);
        settings.username = self.bus.username.clone();
        settings.password = self.bus.password.clone();
        settings.keep_alive = self.bus.keep_alive;
        settings.connect_timeout = self.bus.connect_timeout;
        settings.qos = qos;
        settings.availability_topic = Some(self.mapper()?.availability_topic());
        Ok(settings)
    }

    /// Settings for the bridge engine
    pub fn engine_config(&self) -> EngineConfig {
        let discovery = self
            .discovery
            .enabled
            .then(|| Discovery::new(self.discovery.prefix.clone(), self.bridge.node()));

        EngineConfig {
            drain_grace: self.bridge.drain_grace,
            feed_reconnect: self.reconnect.clone(),
            bus_reconnect: self.reconnect.clone(),
            max_pending: self.bus.max_pending,
            discovery,
        }
    }
}
