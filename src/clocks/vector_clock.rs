use std::cmp::Ordering;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::clocks::client_id::ClientId;

/// Outcome of comparing two vector clocks under the causal partial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    Less,
    Greater,
    Concurrent,
}

/// A mapping from replica to the last known logical clock of that replica.
/// Missing entries read as zero; merge is pointwise max.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: FxHashMap<ClientId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client: &ClientId) -> u64 {
        self.entries.get(client).copied().unwrap_or(0)
    }

    /// Advance the entry for `client` by one and return the new value.
    /// Invoked exactly once per local mutation, before the mutation applies.
    pub fn increment(&mut self, client: ClientId) -> u64 {
        let entry = self.entries.entry(client).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn set(&mut self, client: ClientId, value: u64) {
        self.entries.insert(client, value);
    }

    /// Pointwise max. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &value) in &other.entries {
            let entry = self.entries.entry(*client).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Compare under the causal partial order.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;
        for (client, &value) in &self.entries {
            match value.cmp(&other.get(client)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        for (client, &value) in &other.entries {
            if !self.entries.contains_key(client) && value > 0 {
                less = true;
            }
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Less,
            (false, true) => Causality::Greater,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True iff every entry of `other` is covered by this clock.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Causality::Equal | Causality::Greater)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
