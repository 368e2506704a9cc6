//! Shared helpers for the convergence checks: lightweight replicas with
//! their own clocks, and a permutation-with-duplication harness.

use crate::clocks::client_id::ClientId;
use crate::clocks::hybrid::{HybridClock, HybridTimestamp};
use crate::clocks::vector_clock::VectorClock;
use crate::crdt::{CrdtKind, DeltaPayload, DocumentState, OpId};

/// A bare replica: one client identity, one document state, the clocks a
/// real engine would own. Enough to drive every CRDT without protocol
/// plumbing.
pub struct TestReplica {
    pub client: ClientId,
    pub hlc: HybridClock,
    pub frontier: VectorClock,
    pub state: DocumentState,
    now_ms: u64,
}

impl TestReplica {
    pub fn new(kind: CrdtKind, client_raw: u128) -> Self {
        let client = ClientId::new(client_raw);
        Self {
            client,
            hlc: HybridClock::new(client),
            frontier: VectorClock::new(),
            state: DocumentState::new(kind),
            now_ms: 1_000,
        }
    }

    /// Advance this replica's notion of wall time.
    pub fn set_now(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn stamp(&mut self) -> HybridTimestamp {
        self.hlc.issue(self.now_ms)
    }

    pub fn tick(&mut self) -> u64 {
        self.frontier.increment(self.client)
    }

    pub fn next_op_id(&mut self) -> OpId {
        OpId::new(self.client, self.tick())
    }

    pub fn apply(&mut self, payload: &DeltaPayload) -> bool {
        self.state
            .apply(&"test".to_string(), payload)
            .expect("test payload applies")
    }
}

/// Two replicas of the same kind, the standard fixture.
pub fn twins(kind: CrdtKind) -> (TestReplica, TestReplica) {
    (TestReplica::new(kind, 1), TestReplica::new(kind, 2))
}

pub fn triplet(kind: CrdtKind) -> (TestReplica, TestReplica, TestReplica) {
    (
        TestReplica::new(kind, 1),
        TestReplica::new(kind, 2),
        TestReplica::new(kind, 3),
    )
}

/// Assert that applying `payloads` in every permutation, with every payload
/// applied twice, always converges to the same state. Factorial in the
/// payload count; keep inputs small.
pub fn assert_order_free(kind: CrdtKind, payloads: &[DeltaPayload]) {
    let mut reference: Option<DocumentState> = None;
    for perm in permutations(payloads.len()) {
        let mut state = DocumentState::new(kind);
        for &i in &perm {
            state.apply(&"test".to_string(), &payloads[i]).unwrap();
            state.apply(&"test".to_string(), &payloads[i]).unwrap();
        }
        match &reference {
            None => reference = Some(state),
            Some(expected) => assert_eq!(
                &state, expected,
                "permutation {perm:?} diverged from the first ordering"
            ),
        }
    }
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut indices: Vec<usize> = (0..n).collect();
    heap_permute(&mut indices, n, &mut out);
    out
}

fn heap_permute(indices: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
    if k <= 1 {
        out.push(indices.clone());
        return;
    }
    for i in 0..k {
        heap_permute(indices, k - 1, out);
        if k % 2 == 0 {
            indices.swap(i, k - 1);
        } else {
            indices.swap(0, k - 1);
        }
    }
}
