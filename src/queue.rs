//! Durable FIFO of operations awaiting server acknowledgement.
//!
//! An op is persisted before the mutation is acknowledged to the
//! application, and removed only on ack, rejection, or a superseding sync
//! response. The in-memory index is rebuilt from storage at startup; the
//! zero-padded storage keys make lexicographic recovery order equal
//! issuance order.

use std::collections::VecDeque;

use log::{debug, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::crdt::{Delta, OpId};
use crate::engine::registry::keys;
use crate::error::{Result, SyncError};
use crate::ports::Storage;
use crate::DocId;

/// Per-document cap. Overflow refuses the *new* mutation; queued ops are
/// never dropped.
pub const DEFAULT_QUEUE_CAP: usize = 10_000;

/// How many times a storage write is retried before the failure escalates.
pub const STORAGE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOp {
    pub op: OpId,
    pub doc: DocId,
    pub delta: Delta,
    pub enqueued_at_ms: u64,
    pub attempts: u32,
}

/// An op the server refused; kept for the application, never retried.
#[derive(Debug, Clone)]
pub struct RejectedOp {
    pub pending: PendingOp,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct OfflineQueue {
    order: FxHashMap<DocId, VecDeque<OpId>>,
    ops: FxHashMap<OpId, PendingOp>,
    rejected: Vec<RejectedOp>,
    cap_per_doc: usize,
}

fn put_with_retry(storage: &mut impl Storage, key: &str, bytes: &[u8]) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..STORAGE_RETRIES {
        match storage.put(key, bytes) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("[queue] put {key} failed (attempt {}): {e}", attempt + 1);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SyncError::Storage(format!("put {key} failed"))))
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self {
            cap_per_doc: DEFAULT_QUEUE_CAP,
            ..Self::default()
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap_per_doc = cap;
        self
    }

    /// Rebuild the queue from the `pending/` namespace. Entries that fail to
    /// decode are skipped with a warning rather than wedging startup.
    pub fn recover(storage: &impl Storage) -> Result<Self> {
        let mut queue = Self::new();
        for (key, bytes) in storage.list_prefix("pending/")? {
            match serde_json::from_slice::<PendingOp>(&bytes) {
                Ok(pending) => {
                    queue
                        .order
                        .entry(pending.doc.clone())
                        .or_default()
                        .push_back(pending.op);
                    queue.ops.insert(pending.op, pending);
                }
                Err(e) => warn!("[queue] dropping undecodable pending op {key}: {e}"),
            }
        }
        if !queue.ops.is_empty() {
            debug!("[queue] recovered {} pending ops", queue.ops.len());
        }
        Ok(queue)
    }

    /// Checked at the API boundary before the mutation is applied, so a full
    /// queue refuses the write without touching state.
    pub fn has_capacity(&self, doc: &DocId) -> bool {
        self.order.get(doc).map_or(0, |q| q.len()) < self.cap_per_doc
    }

    /// Persist, then index. The mutation is not acknowledged to the caller
    /// until this returns.
    pub fn enqueue(&mut self, storage: &mut impl Storage, pending: PendingOp) -> Result<()> {
        if !self.has_capacity(&pending.doc) {
            return Err(SyncError::QueueFull {
                doc: pending.doc.clone(),
            });
        }
        let bytes = serde_json::to_vec(&pending)
            .map_err(|e| SyncError::Storage(format!("encode pending op: {e}")))?;
        put_with_retry(storage, &keys::pending(&pending.doc, &pending.op), &bytes)?;
        self.order
            .entry(pending.doc.clone())
            .or_default()
            .push_back(pending.op);
        self.ops.insert(pending.op, pending);
        Ok(())
    }

    /// Server acknowledgement. Returns false for an unknown (duplicate) ack.
    pub fn ack(&mut self, storage: &mut impl Storage, op: &OpId) -> Result<bool> {
        let Some(pending) = self.ops.remove(op) else {
            return Ok(false);
        };
        if let Some(order) = self.order.get_mut(&pending.doc) {
            order.retain(|o| o != op);
        }
        storage.delete(&keys::pending(&pending.doc, op))?;
        Ok(true)
    }

    /// Server refusal: move to the rejected list, never retry.
    pub fn reject(&mut self, storage: &mut impl Storage, op: &OpId, reason: &str) -> Result<bool> {
        let Some(pending) = self.ops.remove(op) else {
            return Ok(false);
        };
        if let Some(order) = self.order.get_mut(&pending.doc) {
            order.retain(|o| o != op);
        }
        storage.delete(&keys::pending(&pending.doc, op))?;
        self.rejected.push(RejectedOp {
            pending,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// The deltas to replay for a document, in original issuance order.
    /// Each call counts as one delivery attempt.
    pub fn replay_for(&mut self, doc: &DocId) -> Vec<Delta> {
        let Some(order) = self.order.get(doc) else {
            return Vec::new();
        };
        let ids: Vec<OpId> = order.iter().copied().collect();
        ids.iter()
            .filter_map(|op| {
                let pending = self.ops.get_mut(op)?;
                pending.attempts += 1;
                Some(pending.delta.clone())
            })
            .collect()
    }

    pub fn len_for(&self, doc: &DocId) -> usize {
        self.order.get(doc).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, op: &OpId) -> bool {
        self.ops.contains_key(op)
    }

    /// Hand the accumulated rejections to the application.
    pub fn take_rejected(&mut self) -> Vec<RejectedOp> {
        std::mem::take(&mut self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocks::client_id::ClientId;
    use crate::clocks::hybrid::HybridTimestamp;
    use crate::clocks::vector_clock::VectorClock;
    use crate::crdt::DeltaPayload;
    use crate::ports::MemoryStorage;

    const A: ClientId = ClientId::new(1);

    fn pending(doc: &str, seq: u64) -> PendingOp {
        let op = OpId::new(A, seq);
        PendingOp {
            op,
            doc: doc.to_string(),
            delta: Delta {
                doc: doc.to_string(),
                op,
                origin: A,
                stamp: HybridTimestamp {
                    wall_ms: seq,
                    client: A,
                },
                clock: VectorClock::new(),
                payload: DeltaPayload::Counter {
                    delta: Default::default(),
                },
            },
            enqueued_at_ms: 0,
            attempts: 0,
        }
    }

    #[test]
    fn enqueue_persists_before_indexing() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        queue.enqueue(&mut storage, pending("notes", 1)).unwrap();
        assert_eq!(storage.list_prefix("pending/notes/").unwrap().len(), 1);
        assert_eq!(queue.len_for(&"notes".to_string()), 1);
    }

    #[test]
    fn recover_restores_issuance_order() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        for seq in [3, 1, 2] {
            // enqueue out of numeric order; storage keys sort by seq
            queue.enqueue(&mut storage, pending("notes", seq)).unwrap();
        }
        let recovered = OfflineQueue::recover(&storage).unwrap();
        let replayed = {
            let mut q = recovered;
            q.replay_for(&"notes".to_string())
        };
        let seqs: Vec<u64> = replayed.iter().map(|d| d.op.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn ack_removes_and_tolerates_duplicates() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        let p = pending("notes", 1);
        let op = p.op;
        queue.enqueue(&mut storage, p).unwrap();

        assert!(queue.ack(&mut storage, &op).unwrap());
        assert!(!queue.ack(&mut storage, &op).unwrap());
        assert!(queue.is_empty());
        assert!(storage.list_prefix("pending/").unwrap().is_empty());
    }

    #[test]
    fn cap_refuses_new_ops_but_keeps_old() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new().with_cap(2);
        queue.enqueue(&mut storage, pending("notes", 1)).unwrap();
        queue.enqueue(&mut storage, pending("notes", 2)).unwrap();
        assert!(!queue.has_capacity(&"notes".to_string()));
        let err = queue.enqueue(&mut storage, pending("notes", 3)).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull { .. }));
        assert_eq!(queue.len_for(&"notes".to_string()), 2);
    }

    #[test]
    fn reject_moves_to_rejected_list() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        let p = pending("notes", 1);
        let op = p.op;
        queue.enqueue(&mut storage, p).unwrap();

        assert!(queue.reject(&mut storage, &op, "unauthorized").unwrap());
        assert!(queue.is_empty());
        let rejected = queue.take_rejected();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, "unauthorized");
        assert!(queue.take_rejected().is_empty());
    }

    #[test]
    fn replay_counts_attempts() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        queue.enqueue(&mut storage, pending("notes", 1)).unwrap();
        queue.replay_for(&"notes".to_string());
        queue.replay_for(&"notes".to_string());
        let op = OpId::new(A, 1);
        assert_eq!(queue.ops.get(&op).unwrap().attempts, 2);
    }

    #[test]
    fn storage_failure_surfaces_after_retries() {
        let mut storage = MemoryStorage::new();
        let mut queue = OfflineQueue::new();
        storage.fail_next_puts(STORAGE_RETRIES);
        assert!(matches!(
            queue.enqueue(&mut storage, pending("notes", 1)),
            Err(SyncError::Storage(_))
        ));
        // Retries exhausted the injected failures; nothing was indexed.
        assert!(queue.is_empty());
    }
}
