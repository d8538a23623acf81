//! MQTT broker configuration

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// MQTT broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client id (default: `evokmq-<node>`)
    pub client_id: Option<String>,
    /// Username for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Timeout waiting for CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// QoS for publications and command subscriptions (0, 1 or 2)
    pub qos: u8,
    /// Publications buffered while the broker is unreachable
    pub max_pending: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            qos: 1,
            max_pending: 1000,
        }
    }
}

impl BusConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Validation("bus.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("bus.port must not be 0".to_string()));
        }
        if self.qos > 2 {
            return Err(ConfigError::Validation(
                "bus.qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::Validation(
                "bus.max_pending must be greater than zero".to_string(),
            ));
        }
        if self.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "bus.keep_alive must be at least 1s".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Validation(
                "bus.password requires bus.username".to_string(),
            ));
        }
        Ok(())
    }
}
