//! Point list configuration

use serde::Deserialize;

use crate::discovery::Component;
use crate::point::{DeviceKind, DevicePoint};

/// One bridged circuit (`[[point]]`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PointConfig {
    /// Evok device type (relay, output, led, input, ai, ao, temp)
    pub dev: DeviceKind,
    /// Evok circuit, e.g. `1` or `2_01`
    pub circuit: String,
    /// Topic level of the point (default: `<dev>_<circuit>`)
    #[serde(default)]
    pub id: Option<String>,
    /// Friendly name used for discovery
    #[serde(default)]
    pub name: Option<String>,
    /// Discovery entity type, e.g. `light` for a relay driving a lamp
    #[serde(default)]
    pub component: Option<Component>,
}

impl PointConfig {
    pub fn to_point(&self) -> DevicePoint {
        let mut point = DevicePoint::new(self.dev, self.circuit.clone());
        if let Some(id) = &self.id {
            point = point.with_id(id.clone());
        }
        if let Some(name) = &self.name {
            point = point.with_name(name.clone());
        }
        if let Some(component) = self.component {
            point = point.with_component(component);
        }
        point
    }
}
