//! Positive-negative counter: two per-replica monotone maps whose difference
//! is the observed value.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::clocks::client_id::ClientId;

/// The delta unit: per-replica running totals. Merge is pointwise max over
/// both maps, so local deltas only need to carry the issuing replica's
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterDelta {
    pub pos: FxHashMap<ClientId, u64>,
    pub neg: FxHashMap<ClientId, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PnCounter {
    pos: FxHashMap<ClientId, u64>,
    neg: FxHashMap<ClientId, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, client: ClientId, n: u64) -> CounterDelta {
        let entry = self.pos.entry(client).or_insert(0);
        *entry += n;
        CounterDelta {
            pos: FxHashMap::from_iter([(client, *entry)]),
            neg: FxHashMap::default(),
        }
    }

    pub fn decrement(&mut self, client: ClientId, n: u64) -> CounterDelta {
        let entry = self.neg.entry(client).or_insert(0);
        *entry += n;
        CounterDelta {
            pos: FxHashMap::default(),
            neg: FxHashMap::from_iter([(client, *entry)]),
        }
    }

    pub fn value(&self) -> i64 {
        let pos: i128 = self.pos.values().map(|&v| v as i128).sum();
        let neg: i128 = self.neg.values().map(|&v| v as i128).sum();
        (pos - neg) as i64
    }

    /// Pointwise max over both maps. Per-replica entries only grow, so this
    /// is commutative, associative and idempotent.
    pub fn apply(&mut self, delta: &CounterDelta) -> bool {
        let mut changed = false;
        for (client, &value) in &delta.pos {
            let entry = self.pos.entry(*client).or_insert(0);
            if value > *entry {
                *entry = value;
                changed = true;
            }
        }
        for (client, &value) in &delta.neg {
            let entry = self.neg.entry(*client).or_insert(0);
            if value > *entry {
                *entry = value;
                changed = true;
            }
        }
        changed
    }

    /// Full state as a delta, for sync responses and state transfer.
    pub fn snapshot(&self) -> CounterDelta {
        CounterDelta {
            pos: self.pos.clone(),
            neg: self.neg.clone(),
        }
    }
}
