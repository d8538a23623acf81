//! Bridge Configuration
//!
//! Topic namespace, payloads and discovery of the bridge.

use std::time::Duration;

use serde::Deserialize;

use crate::discovery::DEFAULT_DISCOVERY_PREFIX;

/// Topic namespace and shutdown behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of this controller (default: hostname)
    pub node: Option<String>,
    /// Prefix of every state and command topic (default: node)
    pub topic_prefix: Option<String>,
    /// Payload for boolean `true`
    pub payload_on: String,
    /// Payload for boolean `false`
    pub payload_off: String,
    /// How long shutdown waits for publications to reach the broker
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node: None,
            topic_prefix: None,
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
            drain_grace: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Get the node name, taken from the hostname if not set
    pub fn node(&self) -> String {
        self.node.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .ok()
                .and_then(|h| h.split('.').next().map(str::to_string))
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "evok".to_string())
        })
    }

    /// Get the topic prefix, defaulting to the node name
    pub fn topic_prefix(&self) -> String {
        self.topic_prefix.clone().unwrap_or_else(|| self.node())
    }
}

/// Home Assistant discovery
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Publish discovery configs on every broker (re)connect
    pub enabled: bool,
    /// Discovery topic prefix
    pub prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_DISCOVERY_PREFIX.to_string(),
        }
    }
}
