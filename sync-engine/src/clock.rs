use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-node causality counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Ahead,
    Behind,
    Equal,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Guarantees an entry for `node`, defaulted to 0.
    pub fn ensure(mut self, node: &str) -> Self {
        self.0.entry(node.to_string()).or_insert(0);
        self
    }

    /// Bumps `node` by one. `None` when the counter is already at `u64::MAX`,
    /// which only a corrupt or hostile remote clock can cause.
    pub fn increment(self, node: &str) -> Option<Self> {
        let mut clock = self.ensure(node);
        let counter = clock.0.get_mut(node)?;
        *counter = counter.checked_add(1)?;
        Some(clock)
    }

    /// Per-key maximum across every input.
    pub fn merge<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> VectorClock {
        let mut merged = BTreeMap::new();
        for clock in clocks {
            for (node, &counter) in &clock.0 {
                let slot = merged.entry(node.clone()).or_insert(0);
                if counter > *slot {
                    *slot = counter;
                }
            }
        }
        VectorClock(merged)
    }

    pub fn merge_from(&mut self, other: &VectorClock) {
        for (node, &counter) in &other.0 {
            let slot = self.0.entry(node.clone()).or_insert(0);
            if counter > *slot {
                *slot = counter;
            }
        }
    }

    /// Dominance check over the union of both key sets. Missing keys count as 0.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut a_ge = true;
        let mut b_ge = true;
        for node in self.0.keys().chain(other.0.keys()) {
            let a = self.get(node);
            let b = other.get(node);
            if a < b {
                a_ge = false;
            }
            if b < a {
                b_ge = false;
            }
        }
        match (a_ge, b_ge) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Ahead,
            (false, true) => ClockOrdering::Behind,
            (false, false) => ClockOrdering::Concurrent,
        }
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        VectorClock(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}
