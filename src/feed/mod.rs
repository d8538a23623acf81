//! Device-State Feed
//!
//! The feed is the controller's real-time state API. The [`FeedClient`]
//! keeps one logical connection to it alive, turns notifications for
//! configured points into [`FeedEvent`]s and writes commands back.
//!
//! The wire protocol sits behind the [`FeedConnector`] / [`FeedSession`]
//! capability traits; [`EvokConnector`] implements them over the Evok
//! WebSocket API.

mod client;
mod evok;

pub use client::FeedClient;
pub use evok::EvokConnector;

use std::fmt;

use async_trait::async_trait;

use crate::point::{FeedAddress, PointId, PointValue};

/// Event produced by the feed client
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A configured point reported a value
    StateChanged { point: PointId, value: PointValue },
    /// The connection to the feed dropped; reconnection is underway
    ConnectionLost,
    /// The connection is (re)established and all points are subscribed
    ConnectionRestored,
}

/// A raw notification from the feed
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub address: FeedAddress,
    pub value: PointValue,
}

/// Error type for feed operations
#[derive(Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Could not establish a session (network, handshake, auth)
    Connect(String),
    /// An established session dropped
    ConnectionLost(String),
    /// A command was refused or could not be delivered
    Command(String),
    /// The feed sent something that violates its protocol
    Protocol(String),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedError::Connect(msg) => write!(f, "Connect failed: {}", msg),
            FeedError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            FeedError::Command(msg) => write!(f, "Command failed: {}", msg),
            FeedError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for FeedError {}

/// Opens sessions to the device-state feed
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Open a new session
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError>;
}

/// One open session with the device-state feed
///
/// `next_notification` must be cancel-safe: the client polls it alongside
/// its command channel and drops the future when a command arrives first.
#[async_trait]
pub trait FeedSession: Send {
    /// Request notifications for the given circuits
    async fn subscribe(&mut self, addresses: &[FeedAddress]) -> Result<(), FeedError>;

    /// Wait for the next notification. An error means the session is gone.
    async fn next_notification(&mut self) -> Result<Notification, FeedError>;

    /// Write a value to a circuit
    async fn invoke(&mut self, address: &FeedAddress, value: PointValue) -> Result<(), FeedError>;

    /// Close the session
    async fn close(&mut self);
}
