//! Vector clocks for causal ordering of operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relation between two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Causality {
    /// Every coordinate ≤ the other's, at least one strictly less.
    Before,
    /// Every coordinate ≥ the other's, at least one strictly greater.
    After,
    /// Strictly-less and strictly-greater coordinates both exist.
    Concurrent,
    /// Identical on every coordinate.
    Equal,
}

/// A mapping from user ID to a monotonic event counter.
///
/// Stored as a `BTreeMap` so serialization order is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    /// A clock with a single coordinate, used at session creation.
    pub fn seeded(user_id: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(user_id.to_string(), 0);
        Self(map)
    }

    /// Bumps the counter for `user_id`, returning the new value.
    pub fn increment(&mut self, user_id: &str) -> u64 {
        let counter = self.0.entry(user_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Coordinate for `user_id`, defaulting to zero.
    pub fn get(&self, user_id: &str) -> u64 {
        self.0.get(user_id).copied().unwrap_or(0)
    }

    /// Takes the coordinatewise maximum of the two clocks.
    pub fn merge(&mut self, other: &VectorClock) {
        for (user, &counter) in &other.0 {
            let entry = self.0.entry(user.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Compares two clocks over the union of their coordinates.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;
        for user in self.0.keys().chain(other.0.keys()) {
            let ours = self.get(user);
            let theirs = other.get(user);
            if ours < theirs {
                less = true;
            } else if ours > theirs {
                greater = true;
            }
        }
        match (less, greater) {
            (true, true) => Causality::Concurrent,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (false, false) => Causality::Equal,
        }
    }
}
