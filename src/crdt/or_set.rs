//! Observed-remove set with add-wins semantics.
//!
//! Every add carries a unique tag; a remove tombstones exactly the tags it
//! observed. A concurrent add issues a fresh tag the remove could not have
//! seen, so the element survives.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::crdt::OpId;

/// The delta unit: tag additions and tag tombstones. Merge is union of
/// both sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDelta {
    pub added: Vec<(String, OpId)>,
    pub removed: Vec<OpId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrSet {
    adds: FxHashMap<String, FxHashSet<OpId>>,
    removed: FxHashSet<OpId>,
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the element under a fresh tag; the caller has ticked the
    /// document clock for it.
    pub fn add(&mut self, element: &str, tag: OpId) -> SetDelta {
        self.adds.entry(element.to_string()).or_default().insert(tag);
        SetDelta {
            added: vec![(element.to_string(), tag)],
            removed: Vec::new(),
        }
    }

    /// Tombstone exactly the tags currently observed for the element.
    pub fn remove(&mut self, element: &str) -> SetDelta {
        let observed: Vec<OpId> = self
            .adds
            .get(element)
            .map(|tags| tags.iter().copied().collect())
            .unwrap_or_default();
        for tag in &observed {
            self.removed.insert(*tag);
        }
        SetDelta {
            added: Vec::new(),
            removed: observed,
        }
    }

    pub fn contains(&self, element: &str) -> bool {
        self.adds
            .get(element)
            .is_some_and(|tags| tags.iter().any(|tag| !self.removed.contains(tag)))
    }

    /// Live elements in unspecified order.
    pub fn elements(&self) -> Vec<&str> {
        self.adds
            .iter()
            .filter(|(_, tags)| tags.iter().any(|tag| !self.removed.contains(tag)))
            .map(|(element, _)| element.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union both tag sets. Commutative, associative, idempotent.
    pub fn apply(&mut self, delta: &SetDelta) -> bool {
        let mut changed = false;
        for (element, tag) in &delta.added {
            changed |= self.adds.entry(element.clone()).or_default().insert(*tag);
        }
        for tag in &delta.removed {
            changed |= self.removed.insert(*tag);
        }
        changed
    }

    /// Full state as a delta, for sync responses and state transfer.
    pub fn snapshot(&self) -> SetDelta {
        SetDelta {
            added: self
                .adds
                .iter()
                .flat_map(|(element, tags)| {
                    tags.iter().map(move |tag| (element.clone(), *tag))
                })
                .collect(),
            removed: self.removed.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::client_id::ClientId;

    const A: ClientId = ClientId::new(1);
    const B: ClientId = ClientId::new(2);

    #[test]
    fn add_then_remove() {
        let mut set = OrSet::new();
        let add = set.add("x", OpId::new(A, 1));
        assert!(set.contains("x"));
        set.remove("x");
        assert!(!set.contains("x"));

        // The tombstone only covers the observed tag.
        let mut other = OrSet::new();
        other.apply(&add);
        assert!(other.contains("x"));
    }

    #[test]
    fn concurrent_add_wins_over_remove() {
        let mut set_a = OrSet::new();
        let mut set_b = OrSet::new();

        // B never observed A's add, so its remove tombstones nothing.
        let add = set_a.add("x", OpId::new(A, 1));
        let remove = set_b.remove("x");

        set_a.apply(&remove);
        set_b.apply(&add);

        assert!(set_a.contains("x"));
        assert!(set_b.contains("x"));
    }

    #[test]
    fn observed_remove_beats_its_own_adds() {
        let mut set_a = OrSet::new();
        let mut set_b = OrSet::new();

        let add = set_a.add("x", OpId::new(A, 1));
        set_b.apply(&add);

        // B observed the add; its remove covers that tag on both sides.
        let remove = set_b.remove("x");
        set_a.apply(&remove);

        assert!(!set_a.contains("x"));
        assert!(!set_b.contains("x"));
    }

    #[test]
    fn apply_is_idempotent_and_order_free() {
        let mut source = OrSet::new();
        let d1 = source.add("x", OpId::new(A, 1));
        let d2 = source.add("y", OpId::new(A, 2));
        let d3 = source.remove("x");

        let deltas = [d1, d2, d3];
        let mut forward = OrSet::new();
        for d in &deltas {
            forward.apply(d);
        }
        let mut shuffled = OrSet::new();
        for d in deltas.iter().rev() {
            shuffled.apply(d);
            shuffled.apply(d);
        }

        assert_eq!(forward, shuffled);
        assert_eq!(forward.elements(), vec!["y"]);
    }

    #[test]
    fn re_add_after_remove_is_visible() {
        let mut set = OrSet::new();
        set.add("x", OpId::new(B, 1));
        set.remove("x");
        assert!(!set.contains("x"));
        set.add("x", OpId::new(B, 2));
        assert!(set.contains("x"));
    }
}
