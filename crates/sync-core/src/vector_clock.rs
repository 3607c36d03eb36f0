//! VectorClock: per-device counters establishing causal order between versions.
//!
//! Every ordering decision in the engine goes through [`VectorClock::compare`].
//! Wall-clock timestamps are never consulted to pick a winner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::DeviceId;

/// Result of comparing two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOrdering {
    /// Left happened strictly before right.
    Before,
    /// Left happened strictly after right.
    After,
    /// Neither dominates: edits were made independently.
    Concurrent,
    /// Identical causal history.
    Equal,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison.
    pub fn reverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }

    /// `Before` or `Equal`.
    pub fn is_before_or_equal(self) -> bool {
        matches!(self, Self::Before | Self::Equal)
    }

    /// `After` or `Equal`.
    pub fn is_after_or_equal(self) -> bool {
        matches!(self, Self::After | Self::Equal)
    }
}

/// Mapping from device id to a monotonically increasing counter.
///
/// Value semantics: [`increment`](Self::increment) and [`merge`](Self::merge)
/// return new clocks and never touch their inputs. A missing entry is
/// equivalent to a zero counter, and zero entries are never stored, so two
/// clocks with the same history always compare (and serialize) equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device (0 if the device never touched this version).
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(device, counter)` pairs in device order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Copy of this clock with `device`'s own counter bumped by one.
    pub fn increment(&self, device: &DeviceId) -> Self {
        let mut next = self.0.clone();
        *next.entry(device.to_string()).or_insert(0) += 1;
        Self(next)
    }

    /// Entrywise maximum of two clocks.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (device, &counter) in &other.0 {
            let entry = merged.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
        Self(merged)
    }

    /// Causal relation of `self` to `other`.
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for device in self.0.keys().chain(other.0.keys()) {
            let (a, b) = (self.get(device), other.get(device));
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v))
                .filter(|(_, v)| *v > 0)
                .collect(),
        )
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (device, counter)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", device, counter)?;
        }
        f.write_str("}")
    }
}
