//! Topic namespace of the bridge
//!
//! Every configured point owns a retained state topic and, when the device
//! accepts commands, a command topic:
//!
//! ```text
//! <prefix>/<point-id>/state   published, retained
//! <prefix>/<point-id>/set     subscribed
//! <prefix>/availability       online/offline, retained
//! ```

mod mapper;
pub mod validation;

pub use mapper::{Payloads, TopicMapper};
pub use validation::{validate_topic_level, validate_topic_name};

use std::fmt;

/// Suffix of state topics
pub const STATE_SUFFIX: &str = "state";

/// Suffix of command topics
pub const COMMAND_SUFFIX: &str = "set";

/// Suffix of the bridge availability topic
pub const AVAILABILITY_SUFFIX: &str = "availability";

/// Direction of a topic binding relative to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Feed state published to the bus
    State,
    /// Commands received from the bus
    Command,
}

/// Errors raised while translating between topics, payloads and points
#[derive(Debug, Clone, PartialEq)]
pub enum TopicError {
    /// No point is bound to the topic
    UnknownTopic(String),
    /// Payload cannot be decoded for the point's value type
    Decode(String),
    /// Configured points cannot be bound to a consistent namespace
    InvalidBinding(String),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::UnknownTopic(topic) => write!(f, "No point bound to topic '{}'", topic),
            TopicError::Decode(msg) => write!(f, "Decode error: {}", msg),
            TopicError::InvalidBinding(msg) => write!(f, "Invalid topic binding: {}", msg),
        }
    }
}

impl std::error::Error for TopicError {}
