//! Per-document replication lifecycle, written as an explicit state machine
//! rather than a chain of continuations so the transitions are testable in
//! isolation.
//!
//! ```text
//! NotTracked ─subscribe→ Subscribing ─SyncResponse→ Synced
//! Synced ─disconnect→ Offline ─reconnect→ Resyncing ─SyncResponse→ Synced
//! ```
//!
//! While `Resyncing`, queued ops replay ahead of any new wire traffic; local
//! mutations keep landing on local state and the queue throughout.

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::clocks::vector_clock::VectorClock;
use crate::protocol::message::ClientMessage;
use crate::DocId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotTracked,
    Subscribing,
    Synced,
    Offline,
    Resyncing,
}

#[derive(Debug, Clone)]
struct DocSession {
    status: SyncStatus,
    /// Whether the application asked for presence on this document.
    awareness: bool,
    /// Whether the document had reached `Synced` at least once; decides
    /// `Subscribing` vs `Resyncing` after a reconnect.
    was_synced: bool,
}

/// Tracks every subscribed document's lifecycle and produces the messages
/// each transition owes the server.
#[derive(Debug, Default)]
pub struct Session {
    docs: FxHashMap<DocId, DocSession>,
    online: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn status(&self, doc: &DocId) -> SyncStatus {
        self.docs
            .get(doc)
            .map(|d| d.status)
            .unwrap_or(SyncStatus::NotTracked)
    }

    /// A delta may go straight onto the wire only for a fully synced
    /// document on a live connection; anything else waits in the queue.
    pub fn ready_to_send(&self, doc: &DocId) -> bool {
        self.online && self.status(doc) == SyncStatus::Synced
    }

    pub fn tracked_docs(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }

    /// Start tracking a document. Emits the subscribe immediately when
    /// online; otherwise the reconnect flow will.
    pub fn subscribe(&mut self, doc: &DocId, clock: &VectorClock) -> Vec<ClientMessage> {
        let entry = self.docs.entry(doc.clone()).or_insert(DocSession {
            status: SyncStatus::Offline,
            awareness: false,
            was_synced: false,
        });
        if !self.online {
            return Vec::new();
        }
        entry.status = SyncStatus::Subscribing;
        vec![
            ClientMessage::Subscribe { doc: doc.clone() },
            ClientMessage::SyncRequest {
                doc: doc.clone(),
                clock: clock.clone(),
            },
        ]
    }

    pub fn subscribe_awareness(&mut self, doc: &DocId) -> Vec<ClientMessage> {
        if let Some(entry) = self.docs.get_mut(doc) {
            entry.awareness = true;
        }
        if self.online {
            vec![ClientMessage::AwarenessSubscribe { doc: doc.clone() }]
        } else {
            Vec::new()
        }
    }

    /// Stop tracking. Also serves as the cancellation path for an in-flight
    /// subscribe: any later sync response for the document is discarded.
    pub fn unsubscribe(&mut self, doc: &DocId) -> Vec<ClientMessage> {
        let was_tracked = self.docs.remove(doc).is_some();
        if was_tracked && self.online {
            vec![ClientMessage::Unsubscribe { doc: doc.clone() }]
        } else {
            Vec::new()
        }
    }

    /// Re-subscribe everything that was tracked before the connection
    /// dropped, carrying each document's local frontier.
    pub fn on_connected(
        &mut self,
        mut frontier_of: impl FnMut(&DocId) -> VectorClock,
    ) -> Vec<ClientMessage> {
        self.online = true;
        let mut messages = Vec::new();
        let mut docs: Vec<&DocId> = self.docs.keys().collect();
        docs.sort(); // deterministic wire order
        let docs: Vec<DocId> = docs.into_iter().cloned().collect();
        for doc in docs {
            let entry = self.docs.get_mut(&doc).unwrap();
            entry.status = if entry.was_synced {
                SyncStatus::Resyncing
            } else {
                SyncStatus::Subscribing
            };
            debug!("[session] {doc}: -> {:?}", entry.status);
            messages.push(ClientMessage::Subscribe { doc: doc.clone() });
            messages.push(ClientMessage::SyncRequest {
                doc: doc.clone(),
                clock: frontier_of(&doc),
            });
            if entry.awareness {
                messages.push(ClientMessage::AwarenessSubscribe { doc: doc.clone() });
            }
        }
        messages
    }

    pub fn on_disconnected(&mut self) {
        self.online = false;
        for (doc, entry) in self.docs.iter_mut() {
            if entry.status != SyncStatus::Offline {
                debug!("[session] {doc}: -> Offline");
            }
            entry.status = SyncStatus::Offline;
        }
    }

    /// A sync response completes the subscribe/resync handshake. Returns
    /// true when the document is tracked and now `Synced`; the caller then
    /// replays the pending queue before sending anything new.
    pub fn on_sync_response(&mut self, doc: &DocId) -> bool {
        match self.docs.get_mut(doc) {
            Some(entry) => {
                entry.status = SyncStatus::Synced;
                entry.was_synced = true;
                debug!("[session] {doc}: -> Synced");
                true
            }
            None => {
                warn!("[session] sync response for untracked document {doc}");
                false
            }
        }
    }
}
