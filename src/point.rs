//! Device Points
//!
//! A device point is one observable or controllable circuit exposed by the
//! Evok API (e.g. relay 3, digital input 1_02). Its identity is fixed by the
//! configuration; its value changes with every feed notification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::discovery::Component;

/// Device type as named by the Evok API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Relay output
    Relay,
    /// Digital output
    #[serde(alias = "do")]
    Output,
    /// User LED
    Led,
    /// Digital input
    #[serde(alias = "di")]
    Input,
    /// Analog input
    Ai,
    /// Analog output
    Ao,
    /// 1-Wire temperature sensor
    Temp,
}

impl DeviceKind {
    /// Name of this device type on the Evok wire
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Relay => "relay",
            DeviceKind::Output => "output",
            DeviceKind::Led => "led",
            DeviceKind::Input => "input",
            DeviceKind::Ai => "ai",
            DeviceKind::Ao => "ao",
            DeviceKind::Temp => "temp",
        }
    }

    /// Type of the values carried by this device
    pub fn value_kind(&self) -> ValueKind {
        match self {
            DeviceKind::Relay | DeviceKind::Output | DeviceKind::Led | DeviceKind::Input => {
                ValueKind::Boolean
            }
            DeviceKind::Ai | DeviceKind::Ao | DeviceKind::Temp => ValueKind::Numeric,
        }
    }

    /// Whether the device accepts `set` commands
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            DeviceKind::Relay | DeviceKind::Output | DeviceKind::Led | DeviceKind::Ao
        )
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relay" => Ok(DeviceKind::Relay),
            "output" | "do" => Ok(DeviceKind::Output),
            "led" => Ok(DeviceKind::Led),
            "input" | "di" => Ok(DeviceKind::Input),
            "ai" => Ok(DeviceKind::Ai),
            "ao" => Ok(DeviceKind::Ao),
            "temp" => Ok(DeviceKind::Temp),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

/// Type of value a point carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Numeric,
}

/// Current value of a point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Bool(bool),
    Number(f64),
}

impl PointValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PointValue::Bool(_) => ValueKind::Boolean,
            PointValue::Number(_) => ValueKind::Numeric,
        }
    }

    /// Convert a raw feed value to the given kind.
    ///
    /// Evok reports binary circuits as `0`/`1`, so numbers coerce to booleans
    /// (non-zero is on). Booleans coerce to `0.0`/`1.0`. Non-finite numbers
    /// never coerce.
    pub fn coerce(self, kind: ValueKind) -> Option<PointValue> {
        match (self, kind) {
            (PointValue::Bool(b), ValueKind::Boolean) => Some(PointValue::Bool(b)),
            (PointValue::Bool(b), ValueKind::Numeric) => {
                Some(PointValue::Number(if b { 1.0 } else { 0.0 }))
            }
            (PointValue::Number(n), _) if !n.is_finite() => None,
            (PointValue::Number(n), ValueKind::Boolean) => Some(PointValue::Bool(n != 0.0)),
            (PointValue::Number(n), ValueKind::Numeric) => Some(PointValue::Number(n)),
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Bool(b) => write!(f, "{}", b),
            PointValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Bus-facing identifier of a point, used as a single topic level
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PointId(String);

impl PointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Location of a circuit on the feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedAddress {
    pub dev: DeviceKind,
    pub circuit: String,
}

impl FeedAddress {
    pub fn new(dev: DeviceKind, circuit: impl Into<String>) -> Self {
        Self {
            dev,
            circuit: circuit.into(),
        }
    }
}

impl fmt::Display for FeedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dev, self.circuit)
    }
}

/// A configured device point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePoint {
    pub id: PointId,
    pub address: FeedAddress,
    /// Human-readable name, used for discovery
    pub name: Option<String>,
    /// Discovery entity type, overriding the one implied by the device kind
    pub component: Option<Component>,
}

impl DevicePoint {
    /// Create a point with the default identifier `<dev>_<circuit>`
    pub fn new(dev: DeviceKind, circuit: impl Into<String>) -> Self {
        let address = FeedAddress::new(dev, circuit);
        let id = PointId::new(format!("{}_{}", address.dev, address.circuit));
        Self {
            id,
            address,
            name: None,
            component: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = PointId::new(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.address.dev
    }

    pub fn value_kind(&self) -> ValueKind {
        self.address.dev.value_kind()
    }

    pub fn is_writable(&self) -> bool {
        self.address.dev.is_writable()
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.address.dev, self.address.circuit))
    }
}
