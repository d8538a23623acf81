//! Topic Mapping between device points and bus topics
//!
//! Translates point identifiers to topics and back, and feed values to bus
//! payloads and back. The mapping is derived entirely from the configured
//! points, so it is deterministic and free of side effects.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use super::validation::{validate_topic_level, validate_topic_name};
use super::{Direction, TopicError, AVAILABILITY_SUFFIX, COMMAND_SUFFIX, STATE_SUFFIX};
use crate::point::{DevicePoint, PointId, PointValue, ValueKind};

/// Payloads used for boolean values on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payloads {
    pub on: String,
    pub off: String,
}

impl Default for Payloads {
    fn default() -> Self {
        Self {
            on: "ON".to_string(),
            off: "OFF".to_string(),
        }
    }
}

/// Maps device points to bus topics and values to payloads
#[derive(Debug, Clone)]
pub struct TopicMapper {
    /// Topic prefix shared by every binding
    prefix: String,
    /// Boolean payloads
    payloads: Payloads,
    /// Points in configuration order
    points: Vec<DevicePoint>,
    /// Point identifier -> index into `points`
    by_id: HashMap<PointId, usize>,
    /// Command topic -> index into `points`
    by_command_topic: HashMap<String, usize>,
}

impl TopicMapper {
    /// Build the mapper, checking that every point binds to a distinct topic
    pub fn new(
        prefix: impl Into<String>,
        payloads: Payloads,
        points: Vec<DevicePoint>,
    ) -> Result<Self, TopicError> {
        let prefix = prefix.into();
        validate_topic_name(&prefix)
            .map_err(|e| TopicError::InvalidBinding(format!("prefix '{}': {}", prefix, e)))?;

        if payloads.on == payloads.off {
            return Err(TopicError::InvalidBinding(format!(
                "payload_on and payload_off must differ (both '{}')",
                payloads.on
            )));
        }

        let mut by_id = HashMap::with_capacity(points.len());
        let mut by_command_topic = HashMap::new();
        let mut state_topics = HashSet::with_capacity(points.len());
        let mut addresses = HashSet::with_capacity(points.len());

        for (idx, point) in points.iter().enumerate() {
            validate_topic_level(point.id.as_str()).map_err(|e| {
                TopicError::InvalidBinding(format!("point id '{}': {}", point.id, e))
            })?;

            if by_id.insert(point.id.clone(), idx).is_some() {
                return Err(TopicError::InvalidBinding(format!(
                    "duplicate point id '{}'",
                    point.id
                )));
            }

            if !addresses.insert(point.address.clone()) {
                return Err(TopicError::InvalidBinding(format!(
                    "circuit {} is configured more than once",
                    point.address
                )));
            }

            state_topics.insert(Self::build_topic(&prefix, &point.id, STATE_SUFFIX));
            if point.is_writable() {
                by_command_topic.insert(Self::build_topic(&prefix, &point.id, COMMAND_SUFFIX), idx);
            }
        }

        // State and command namespaces must stay disjoint
        if let Some(topic) = by_command_topic.keys().find(|t| state_topics.contains(*t)) {
            return Err(TopicError::InvalidBinding(format!(
                "topic '{}' is both a state and a command topic",
                topic
            )));
        }

        Ok(Self {
            prefix,
            payloads,
            points,
            by_id,
            by_command_topic,
        })
    }

    fn build_topic(prefix: &str, id: &PointId, suffix: &str) -> String {
        format!("{}/{}/{}", prefix, id, suffix)
    }

    /// Topic prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Boolean payloads
    pub fn payloads(&self) -> &Payloads {
        &self.payloads
    }

    /// All configured points, in configuration order
    pub fn points(&self) -> &[DevicePoint] {
        &self.points
    }

    /// Look up a point by identifier
    pub fn point(&self, id: &PointId) -> Option<&DevicePoint> {
        self.by_id.get(id).map(|&idx| &self.points[idx])
    }

    /// Topic bound to a point in the given direction.
    ///
    /// Returns `None` for unknown points and for the command direction of
    /// read-only points.
    pub fn topic_for(&self, id: &PointId, direction: Direction) -> Option<String> {
        let point = self.point(id)?;
        match direction {
            Direction::State => Some(Self::build_topic(&self.prefix, &point.id, STATE_SUFFIX)),
            Direction::Command if point.is_writable() => {
                Some(Self::build_topic(&self.prefix, &point.id, COMMAND_SUFFIX))
            }
            Direction::Command => None,
        }
    }

    /// Resolve a command topic to its point
    pub fn point_for(&self, topic: &str) -> Result<&DevicePoint, TopicError> {
        self.by_command_topic
            .get(topic)
            .map(|&idx| &self.points[idx])
            .ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))
    }

    /// Every command topic, for the bus subscription
    pub fn command_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.by_command_topic.keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Topic carrying the bridge's own online/offline status
    pub fn availability_topic(&self) -> String {
        format!("{}/{}", self.prefix, AVAILABILITY_SUFFIX)
    }

    /// Encode a value as a bus payload
    pub fn encode(&self, value: &PointValue) -> Bytes {
        match value {
            PointValue::Bool(true) => Bytes::from(self.payloads.on.clone()),
            PointValue::Bool(false) => Bytes::from(self.payloads.off.clone()),
            PointValue::Number(n) => Bytes::from(n.to_string()),
        }
    }

    /// Decode a bus payload as a value of the given kind
    pub fn decode(&self, payload: &[u8], kind: ValueKind) -> Result<PointValue, TopicError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| TopicError::Decode("payload is not valid UTF-8".to_string()))?
            .trim();

        match kind {
            ValueKind::Boolean => self.decode_bool(text).map(PointValue::Bool),
            ValueKind::Numeric => match text.parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(PointValue::Number(n)),
                Ok(_) => Err(TopicError::Decode(format!("'{}' is not a finite number", text))),
                Err(_) => Err(TopicError::Decode(format!("'{}' is not a number", text))),
            },
        }
    }

    fn decode_bool(&self, text: &str) -> Result<bool, TopicError> {
        if text == self.payloads.on {
            return Ok(true);
        }
        if text == self.payloads.off {
            return Ok(false);
        }
        match text.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Ok(true),
            "off" | "false" | "0" => Ok(false),
            _ => Err(TopicError::Decode(format!(
                "'{}' is neither '{}' nor '{}'",
                text, self.payloads.on, self.payloads.off
            ))),
        }
    }
}
