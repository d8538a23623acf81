//! Message Bus
//!
//! The [`BusClient`] keeps one logical connection to the MQTT broker. It
//! publishes state, delivers command messages as [`BusEvent`]s and buffers
//! publications while the broker is unreachable.
//!
//! The wire protocol sits behind the [`BusConnector`] / [`BusSession`]
//! capability traits; [`MqttConnector`] implements them with `rumqttc`.

mod client;
mod mqtt;
mod queue;

pub use client::{BusClient, BusOptions};
pub use mqtt::{qos_from_level, MqttConnector, MqttSettings};
pub use queue::PendingQueue;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

/// Availability payload published once the bridge is connected
pub const AVAILABILITY_ONLINE: &str = "online";

/// Availability payload published on clean shutdown and set as last will
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Event produced by the bus client
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A message arrived on a subscribed command topic
    CommandReceived { topic: String, payload: Bytes },
    /// The connection to the broker dropped; reconnection is underway
    ConnectionLost,
    /// The connection is (re)established and the backlog has been sent
    ConnectionRestored,
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Error type for bus operations
#[derive(Debug, Clone, PartialEq)]
pub enum BusError {
    /// Could not establish a session (network, CONNACK refused)
    Connect(String),
    /// An established session dropped
    ConnectionLost(String),
    /// The pending buffer was full; the oldest queued publication was dropped
    Backpressure { dropped_topic: String },
    /// The client has been closed
    Closed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            BusError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BusError::Backpressure { dropped_topic } => write!(
                f,
                "Publish buffer full, dropped queued update for '{}'",
                dropped_topic
            ),
            BusError::Closed => write!(f, "Bus client closed"),
        }
    }
}

impl std::error::Error for BusError {}

/// Opens sessions to the message bus
#[async_trait]
pub trait BusConnector: Send + Sync + 'static {
    /// Open a new session
    async fn connect(&self) -> Result<Box<dyn BusSession>, BusError>;
}

/// One open session with the message bus
///
/// `next_message` must be cancel-safe: the client polls it alongside its
/// publish channel and drops the future when a publication arrives first.
#[async_trait]
pub trait BusSession: Send {
    /// Subscribe to the given topic filters
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), BusError>;

    /// Publish a message
    async fn publish(&mut self, publication: &Publication) -> Result<(), BusError>;

    /// Wait for the next message on a subscribed topic. An error means the
    /// session is gone.
    async fn next_message(&mut self) -> Result<InboundMessage, BusError>;

    /// Close the session
    async fn close(&mut self);
}
