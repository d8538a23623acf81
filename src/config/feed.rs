//! Evok feed configuration

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Default Evok WebSocket endpoint
pub(super) const DEFAULT_URL: &str = "ws://localhost/ws";

/// Evok feed connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// WebSocket URL of the Evok API
    pub url: String,
    /// Timeout for the WebSocket handshake
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl FeedConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let scheme = self.url.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("ws") | Some("wss") => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "feed.url must be a ws:// or wss:// URL, got '{}'",
                    self.url
                )))
            }
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "feed.connect_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
