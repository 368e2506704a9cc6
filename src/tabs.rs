//! Cross-tab fan-out over a same-origin broadcast channel.
//!
//! Tabs share the persistent store, so a fingerprint `{doc, op}` is enough
//! for siblings to fetch and apply a committed delta. An LRU of recently
//! committed op ids prevents loops and duplicate application when the same
//! op also arrives through the server fan-out. One tab at a time owns a
//! document's network sync, elected by first claim; the lowest tab id wins
//! a contested claim.

use std::num::NonZeroUsize;

use log::debug;
use lru::LruCache;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::crdt::OpId;
use crate::DocId;

/// Minimum dedup window per tab.
pub const FINGERPRINT_LRU_CAP: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TabMessage {
    /// A delta was committed locally or from the server; siblings load it
    /// from storage by op id.
    Commit { doc: DocId, op: OpId },
    /// Leadership handshake: the sender wants network ownership of a doc.
    Claim { doc: DocId, tab: u64 },
    /// The owning tab is closing; someone else may elect itself.
    Release { doc: DocId, tab: u64 },
}

/// What a received broadcast frame asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TabEvent {
    /// Apply a sibling's committed delta out of shared storage.
    ApplySibling { doc: DocId, op: OpId },
    /// A lower tab id claimed a document we were leading.
    LeadershipLost { doc: DocId },
    /// A higher tab id claimed a document we lead: announce our claim again
    /// so the newcomer cedes.
    ReassertClaim { doc: DocId },
    /// The leader released a document; claim it if we have it open.
    LeaderVacated { doc: DocId },
}

#[derive(Debug)]
pub struct TabBus {
    tab: u64,
    recent: LruCache<OpId, ()>,
    leading: FxHashSet<DocId>,
}

impl TabBus {
    pub fn new() -> Self {
        Self::with_tab_id(rand::random::<u64>())
    }

    pub fn with_tab_id(tab: u64) -> Self {
        Self {
            tab,
            recent: LruCache::new(
                NonZeroUsize::new(FINGERPRINT_LRU_CAP).expect("cap is non-zero"),
            ),
            leading: FxHashSet::default(),
        }
    }

    pub fn tab_id(&self) -> u64 {
        self.tab
    }

    /// Remember a committed op so its echo (sibling re-broadcast or server
    /// fan-out) is not applied twice.
    pub fn record(&mut self, op: OpId) {
        self.recent.put(op, ());
    }

    pub fn seen(&self, op: &OpId) -> bool {
        self.recent.contains(op)
    }

    /// The frame to publish after committing `op`.
    pub fn commit_message(&mut self, doc: &DocId, op: OpId) -> TabMessage {
        self.record(op);
        TabMessage::Commit {
            doc: doc.clone(),
            op,
        }
    }

    /// Elect this tab as the document's network owner and announce it.
    pub fn claim(&mut self, doc: &DocId) -> TabMessage {
        self.leading.insert(doc.clone());
        TabMessage::Claim {
            doc: doc.clone(),
            tab: self.tab,
        }
    }

    pub fn release(&mut self, doc: &DocId) -> TabMessage {
        self.leading.remove(doc);
        TabMessage::Release {
            doc: doc.clone(),
            tab: self.tab,
        }
    }

    pub fn is_leader(&self, doc: &DocId) -> bool {
        self.leading.contains(doc)
    }

    pub fn on_message(&mut self, message: TabMessage) -> Option<TabEvent> {
        match message {
            TabMessage::Commit { doc, op } => {
                if self.seen(&op) {
                    return None;
                }
                self.record(op);
                Some(TabEvent::ApplySibling { doc, op })
            }
            TabMessage::Claim { doc, tab } => {
                if tab == self.tab || !self.leading.contains(&doc) {
                    return None;
                }
                if tab < self.tab {
                    debug!("[tabs] ceding {doc} to tab {tab:x}");
                    self.leading.remove(&doc);
                    Some(TabEvent::LeadershipLost { doc })
                } else {
                    Some(TabEvent::ReassertClaim { doc })
                }
            }
            TabMessage::Release { doc, tab } => {
                if tab == self.tab {
                    None
                } else {
                    Some(TabEvent::LeaderVacated { doc })
                }
            }
        }
    }
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new()
    }
}
