//! Last-known value of every observed point

use std::collections::BTreeMap;

use crate::point::{PointId, PointValue};

/// Last value received from the feed for each point.
///
/// Only points observed at least once have an entry. Iteration is ordered by
/// point identifier so resyncs publish in a stable order.
#[derive(Debug, Default)]
pub struct StateSnapshot {
    values: BTreeMap<PointId, PointValue>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value, returning the previous one
    pub fn update(&mut self, id: PointId, value: PointValue) -> Option<PointValue> {
        self.values.insert(id, value)
    }

    pub fn get(&self, id: &PointId) -> Option<PointValue> {
        self.values.get(id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PointId, &PointValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
