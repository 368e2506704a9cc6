//! Ephemeral presence state, synchronized outside the CRDT storage path.
//!
//! Each replica owns its slot; freshness is decided by a per-replica
//! logical clock, never by wall time, so clock skew cannot make presence
//! flap. Entries are never persisted.

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clocks::client_id::ClientId;
use crate::DocId;

/// Sentinel clock value announcing a clean departure. Any real update uses
/// strictly smaller values, so a leave always wins.
pub const LEAVE_CLOCK: u64 = u64::MAX;

/// Default entry lifetime without updates; the engine heartbeats well under
/// this.
pub const DEFAULT_TTL_MS: u64 = 30_000;

pub type AwarenessStateMap = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub state: AwarenessStateMap,
    pub clock: u64,
    #[serde(default)]
    pub last_seen_ms: u64,
}

/// The wire unit for presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessUpdate {
    pub doc: DocId,
    pub client: ClientId,
    pub state: AwarenessStateMap,
    pub clock: u64,
}

/// Presence table for one document.
#[derive(Debug)]
pub struct Awareness {
    doc: DocId,
    client: ClientId,
    local_clock: u64,
    entries: FxHashMap<ClientId, AwarenessEntry>,
    ttl_ms: u64,
}

impl Awareness {
    pub fn new(doc: DocId, client: ClientId) -> Self {
        Self {
            doc,
            client,
            local_clock: 0,
            entries: FxHashMap::default(),
            ttl_ms: DEFAULT_TTL_MS,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Record the local state under a fresh clock and produce the update to
    /// broadcast.
    pub fn set_local_state(&mut self, state: AwarenessStateMap, now_ms: u64) -> AwarenessUpdate {
        self.local_clock += 1;
        let update = AwarenessUpdate {
            doc: self.doc.clone(),
            client: self.client,
            state: state.clone(),
            clock: self.local_clock,
        };
        self.entries.insert(
            self.client,
            AwarenessEntry {
                client: self.client,
                state,
                clock: self.local_clock,
                last_seen_ms: now_ms,
            },
        );
        update
    }

    /// Re-announce the current local state, for heartbeats.
    pub fn heartbeat(&mut self, now_ms: u64) -> Option<AwarenessUpdate> {
        let state = self.entries.get(&self.client)?.state.clone();
        Some(self.set_local_state(state, now_ms))
    }

    /// The update to send on clean shutdown.
    pub fn leave_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            doc: self.doc.clone(),
            client: self.client,
            state: AwarenessStateMap::new(),
            clock: LEAVE_CLOCK,
        }
    }

    /// Install a peer update iff it is strictly fresher than what we hold
    /// for that replica. Returns whether the table changed.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now_ms: u64) -> bool {
        let known = self.entries.get(&update.client).map(|e| e.clock).unwrap_or(0);
        if update.clock <= known {
            debug!(
                "[awareness] {} stale update from {} ({} <= {})",
                self.doc, update.client, update.clock, known
            );
            return false;
        }
        if update.clock == LEAVE_CLOCK {
            return self.entries.remove(&update.client).is_some();
        }
        self.entries.insert(
            update.client,
            AwarenessEntry {
                client: update.client,
                state: update.state.clone(),
                clock: update.clock,
                last_seen_ms: now_ms,
            },
        );
        true
    }

    /// Drop peers that stopped heartbeating. The local entry never expires
    /// this way.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<ClientId> {
        let ttl = self.ttl_ms;
        let local = self.client;
        let gone: Vec<ClientId> = self
            .entries
            .values()
            .filter(|e| e.client != local && now_ms.saturating_sub(e.last_seen_ms) > ttl)
            .map(|e| e.client)
            .collect();
        for client in &gone {
            self.entries.remove(client);
        }
        gone
    }

    /// All live entries, local included.
    pub fn states(&self) -> impl Iterator<Item = &AwarenessEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
