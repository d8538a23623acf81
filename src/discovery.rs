//! Home Assistant MQTT discovery
//!
//! Builds one retained config message per point so Home Assistant creates
//! matching entities on its own. Config topics follow
//! `<discovery-prefix>/<component>/<node>/<point-id>/config`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE};
use crate::point::{DeviceKind, DevicePoint, ValueKind};
use crate::topic::{Direction, TopicMapper};

/// Default discovery prefix used by Home Assistant
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Home Assistant entity platform a point is announced as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Switch,
    Light,
    BinarySensor,
    Sensor,
    Number,
}

impl Component {
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Relay | DeviceKind::Output | DeviceKind::Led => Component::Switch,
            DeviceKind::Input => Component::BinarySensor,
            DeviceKind::Ai | DeviceKind::Temp => Component::Sensor,
            DeviceKind::Ao => Component::Number,
        }
    }

    /// Component of a point: its configured override, else the default for
    /// its device kind
    pub fn for_point(point: &DevicePoint) -> Self {
        point
            .component
            .unwrap_or_else(|| Component::for_kind(point.kind()))
    }

    /// Whether a device of `kind` can be announced as this component
    pub fn supports(&self, kind: DeviceKind) -> bool {
        let binary = kind.value_kind() == ValueKind::Boolean;
        match self {
            Component::Switch | Component::Light => binary && kind.is_writable(),
            Component::BinarySensor => binary,
            Component::Sensor => true,
            Component::Number => !binary && kind.is_writable(),
        }
    }

    /// Whether Home Assistant sends commands to entities of this component
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Component::Switch | Component::Light | Component::Number)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Switch => "switch",
            Component::Light => "light",
            Component::BinarySensor => "binary_sensor",
            Component::Sensor => "sensor",
            Component::Number => "number",
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'static str,
    model: &'static str,
}

#[derive(Debug, Serialize)]
struct EntityConfig<'a> {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    availability_topic: String,
    payload_available: &'static str,
    payload_not_available: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<f64>,
    device: DeviceInfo<'a>,
}

/// A discovery config message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub topic: String,
    pub payload: Bytes,
}

/// Builds discovery messages for a node
#[derive(Debug, Clone)]
pub struct Discovery {
    prefix: String,
    node: String,
}

impl Discovery {
    pub fn new(prefix: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            node: node.into(),
        }
    }

    /// Config topic of a point
    pub fn config_topic(&self, point: &DevicePoint) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.prefix,
            Component::for_point(point).as_str(),
            self.node,
            point.id
        )
    }

    /// One announcement per configured point, in configuration order
    pub fn announcements(&self, mapper: &TopicMapper) -> Vec<Announcement> {
        mapper
            .points()
            .iter()
            .filter_map(|point| {
                let config = self.entity_config(mapper, point)?;
                let payload = serde_json::to_vec(&config).ok()?;
                Some(Announcement {
                    topic: self.config_topic(point),
                    payload: Bytes::from(payload),
                })
            })
            .collect()
    }

    fn entity_config<'a>(
        &'a self,
        mapper: &'a TopicMapper,
        point: &DevicePoint,
    ) -> Option<EntityConfig<'a>> {
        let kind = point.kind();
        let component = Component::for_point(point);
        let binary = matches!(
            component,
            Component::Switch | Component::Light | Component::BinarySensor
        );
        let payloads = mapper.payloads();

        let (device_class, unit) = match kind {
            DeviceKind::Temp => (Some("temperature"), Some("°C")),
            DeviceKind::Ai => (Some("voltage"), Some("V")),
            DeviceKind::Ao => (None, Some("V")),
            _ => (None, None),
        };

        // Analog outputs drive 0-10 V
        let (min, max, step) = if component == Component::Number {
            (Some(0.0), Some(10.0), Some(0.01))
        } else {
            (None, None, None)
        };

        Some(EntityConfig {
            name: point.display_name(),
            unique_id: format!("{}_{}", self.node, point.id),
            state_topic: mapper.topic_for(&point.id, Direction::State)?,
            command_topic: component
                .accepts_commands()
                .then(|| mapper.topic_for(&point.id, Direction::Command))
                .flatten(),
            availability_topic: mapper.availability_topic(),
            payload_available: AVAILABILITY_ONLINE,
            payload_not_available: AVAILABILITY_OFFLINE,
            payload_on: binary.then_some(payloads.on.as_str()),
            payload_off: binary.then_some(payloads.off.as_str()),
            device_class,
            unit_of_measurement: unit,
            min,
            max,
            step,
            device: DeviceInfo {
                identifiers: [self.node.as_str()],
                name: self.node.as_str(),
                manufacturer: "UniPi",
                model: "Evok",
            },
        })
    }
}
