//! evokmq - Bridge between UniPi Evok and MQTT
//!
//! Mirrors the state of Evok-controlled circuits (relays, inputs, sensors)
//! to retained MQTT topics and writes commands received over MQTT back to
//! the controller. Both connections recover on their own; after every
//! reconnection the last known state is republished.

pub mod backoff;
pub mod bus;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod feed;
pub mod point;
pub mod topic;

pub use backoff::ReconnectPolicy;
pub use bus::{BusClient, BusConnector, BusError, BusEvent, BusSession, MqttConnector};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionState, EventStream};
pub use engine::{BridgeEngine, EngineConfig, EngineReport, EngineState};
pub use feed::{EvokConnector, FeedClient, FeedConnector, FeedError, FeedEvent, FeedSession};
pub use point::{DeviceKind, DevicePoint, PointId, PointValue, ValueKind};
pub use topic::{Direction, Payloads, TopicError, TopicMapper};
