//! Vector clocks and monotonic local timestamps.
//!
//! Every order and trade event carries a [`VectorClock`] stamp assigned by
//! the originating node. Clocks admit a partial order: comparing two stamps
//! tells whether one event happened-before the other or whether they are
//! concurrent, in which case the event queue falls back to wall timestamp
//! and event id tie-breaks.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Result of comparing two [`VectorClock`]s under the causal partial order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CausalOrder {
    Less,
    Greater,
    Equal,
    Concurrent,
}

/// Per-node causal timestamp.
///
/// Entries map node id → counter and are strictly non-decreasing. Only the
/// owning node's entry is advanced by [`VectorClock::tick`]; merging via
/// [`VectorClock::update`] takes the pointwise maximum over the union of
/// keys and then ticks the local entry once.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VectorClock {
    node_id: SmolStr,
    clock: FnvHashMap<SmolStr, u64>,
}

impl VectorClock {
    pub fn new(node_id: impl Into<SmolStr>) -> Self {
        Self {
            node_id: node_id.into(),
            clock: FnvHashMap::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Counter recorded for `node`, zero when unknown.
    pub fn get(&self, node: &str) -> u64 {
        self.clock.get(node).copied().unwrap_or(0)
    }

    /// Advance the local entry by one and return its new value.
    pub fn tick(&mut self) -> u64 {
        let entry = self.clock.entry(self.node_id.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Merge `other` into this clock: pointwise maximum over the union of
    /// every known node, then a single local tick.
    ///
    /// The max must cover all of `other`'s entries, not just its owner's,
    /// or knowledge of third nodes is lost across partitions.
    pub fn update(&mut self, other: &VectorClock) {
        for (node, &counter) in &other.clock {
            let entry = self.clock.entry(node.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
        self.tick();
    }

    /// Compare two clocks under the causal partial order, inspecting every
    /// entry in the union of keys.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for node in self.clock.keys().chain(other.clock.keys()) {
            let ours = self.get(node);
            let theirs = other.get(node);
            if ours < theirs {
                less = true;
            } else if ours > theirs {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Less,
            (false, true) => CausalOrder::Greater,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Less
    }

    /// Sum of all entries.
    ///
    /// Strictly increases along every happens-before edge, so sorting
    /// events by `(total, wall timestamp, event id)` yields a
    /// deterministic linearization of the causal partial order.
    pub fn total(&self) -> u64 {
        self.clock.values().sum()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.clock.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        write!(f, "{}{{", self.node_id)?;
        for (i, (node, counter)) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{node}:{counter}")?;
        }
        write!(f, "}}")
    }
}

/// Wire form of a clock stamp: the originating node plus its clock map.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, derive_more::Constructor)]
pub struct StampedClock {
    pub node_id: SmolStr,
    pub clock: FnvHashMap<SmolStr, u64>,
}

impl From<VectorClock> for StampedClock {
    fn from(value: VectorClock) -> Self {
        Self {
            node_id: value.node_id,
            clock: value.clock,
        }
    }
}

impl From<StampedClock> for VectorClock {
    fn from(value: StampedClock) -> Self {
        Self {
            node_id: value.node_id,
            clock: value.clock,
        }
    }
}

/// Monotonic nanosecond timestamps for order creation and event arrival.
///
/// Wall-clock derived but guaranteed strictly increasing on this node, so
/// equal-price orders placed back to back keep a total time order.
#[derive(Debug, Default)]
pub struct MonotonicTimestamps {
    last: AtomicU64,
}

impl MonotonicTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(AtomicOrdering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                next,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}
