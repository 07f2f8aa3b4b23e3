use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::warn;

use crate::core::record::NodeId;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every counter of `self` is <= the other's, at least one strictly.
    Before,
    /// Every counter of `self` is >= the other's, at least one strictly.
    After,
    /// Neither side dominates.
    Concurrent,
    /// All counters equal.
    Identical,
}

/// Causal timestamp: a per-node counter map.
///
/// A missing key counts as 0, so clocks stay compact as nodes come and go.
/// Comparison runs over the union of key sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock seeded with a zero counter for the local node.
    pub fn seeded(node_id: &str) -> Self {
        let mut clock = Self::new();
        clock.counters.insert(node_id.to_string(), 0);
        clock
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, node_id: &str) {
        *self.counters.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Per-node maximum over the union of keys.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.counters {
            let current = self.counters.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(*counter);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        for node_id in self.counters.keys().chain(other.counters.keys()) {
            let ours = self.get(node_id);
            let theirs = other.get(node_id);
            if ours > theirs {
                self_greater = true;
            } else if theirs > ours {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) => ClockOrdering::Identical,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// A clock that never arrived compares as concurrent.
    pub fn compare_opt(&self, other: Option<&VectorClock>) -> ClockOrdering {
        match other {
            Some(other) => self.compare(other),
            None => ClockOrdering::Concurrent,
        }
    }

    /// After or Identical.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Identical
        )
    }

    /// Total, stable tie-break for concurrent clocks: the side whose
    /// `origin|msg_id` tag is lexicographically greater wins on every node.
    pub fn deterministic_winner(self_tag: &str, other_tag: &str) -> bool {
        self_tag > other_tag
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// True when no counter has ever advanced; a seeded-but-idle clock is
    /// still zero.
    pub fn is_zero(&self) -> bool {
        self.counters.values().all(|counter| *counter == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.counters.iter()
    }
}

impl Serialize for VectorClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.counters.len()))?;
        for (node_id, counter) in &self.counters {
            map.serialize_entry(node_id, counter)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Peers may ship malformed counters; coerce them to 0 instead of
        // rejecting the whole frame.
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut counters = BTreeMap::new();
        for (node_id, value) in raw {
            let counter = match value.as_u64() {
                Some(counter) => counter,
                None => {
                    warn!("coercing malformed clock entry {}={} to 0", node_id, value);
                    0
                }
            };
            counters.insert(node_id, counter);
        }
        Ok(VectorClock { counters })
    }
}
