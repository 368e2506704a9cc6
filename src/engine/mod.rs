//! The replica facade: one [`SyncEngine`] owns the open documents, the
//! durable offline queue, the replication session, presence, reconnect
//! supervision and the cross-tab bus, all behind constructor-injected
//! ports.
//!
//! The engine is single-threaded and cooperative: local API calls, inbound
//! transport frames, broadcast frames and timer ticks are serialized by the
//! host onto this one value. A local mutation ticks the document clock,
//! applies, persists, enqueues, notifies, and only then reaches for the
//! wire, so sub-millisecond local writes never wait on the network.

pub mod registry;

use log::{debug, error, warn};
use serde_json::Value;

use rustc_hash::FxHashMap;

use crate::clocks::client_id::ClientId;
use crate::clocks::hybrid::{HybridClock, HybridTimestamp};
use crate::clocks::vector_clock::VectorClock;
use crate::crdt::peritext::AttrMap;
use crate::crdt::{CrdtKind, Delta, DeltaPayload, DocumentState, OpId};
use crate::error::{Counters, Result, SyncError};
use crate::ports::{Broadcast, Storage, TimeSource, Transport};
use crate::protocol::awareness::{Awareness, AwarenessEntry, AwarenessStateMap, AwarenessUpdate};
use crate::protocol::message::{self, ClientMessage, ErrorCode, ServerMessage};
use crate::protocol::session::{Session, SyncStatus};
use crate::queue::{OfflineQueue, PendingOp, RejectedOp, STORAGE_RETRIES};
use crate::reconnect::{Reconnect, TickAction};
use crate::tabs::{TabBus, TabEvent, TabMessage};
use crate::DocId;

use registry::{decode_versioned, encode_versioned, keys, DocumentRegistry};

/// Presence heartbeat cadence, well under the awareness TTL.
pub const AWARENESS_HEARTBEAT_MS: u64 = 10_000;

/// Change notification: subscribers receive the document state after every
/// visible change, in issuance order for local mutations.
pub type ChangeCallback = Box<dyn FnMut(&DocumentState)>;

/// What the host adapter owes the engine after a tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// The backoff window elapsed; establish a connection and call
    /// [`SyncEngine::on_connected`].
    pub reconnect_due: bool,
}

pub struct SyncEngine<S, T, B, C>
where
    S: Storage,
    T: Transport,
    B: Broadcast,
    C: TimeSource,
{
    client: ClientId,
    hlc: HybridClock,
    registry: DocumentRegistry,
    queue: OfflineQueue,
    session: Session,
    awareness: FxHashMap<DocId, Awareness>,
    reconnect: Reconnect,
    tabs: TabBus,
    subscribers: FxHashMap<DocId, Vec<ChangeCallback>>,
    counters: Counters,
    next_awareness_beat_ms: u64,
    closed: bool,
    storage: S,
    transport: T,
    broadcast: B,
    time: C,
}

impl<S, T, B, C> SyncEngine<S, T, B, C>
where
    S: Storage,
    T: Transport,
    B: Broadcast,
    C: TimeSource,
{
    /// Build a replica over its four ports. Loads (or mints and persists)
    /// the client identity and recovers the pending-op log.
    pub fn new(mut storage: S, transport: T, broadcast: B, time: C) -> Result<Self> {
        let client = match storage.get(&keys::client_id())? {
            Some(bytes) => {
                let hex = String::from_utf8_lossy(&bytes);
                ClientId::from_hex(hex.trim())
                    .ok_or_else(|| SyncError::Storage(format!("malformed client id: {hex}")))?
            }
            None => {
                let client = ClientId::generate();
                storage.put(&keys::client_id(), client.to_hex().as_bytes())?;
                debug!("[engine] minted client id {client}");
                client
            }
        };
        let queue = OfflineQueue::recover(&storage)?;
        Ok(Self {
            client,
            hlc: HybridClock::new(client),
            registry: DocumentRegistry::new(),
            queue,
            session: Session::new(),
            awareness: FxHashMap::default(),
            reconnect: Reconnect::new(),
            tabs: TabBus::new(),
            subscribers: FxHashMap::default(),
            counters: Counters::default(),
            next_awareness_beat_ms: 0,
            closed: false,
            storage,
            transport,
            broadcast,
            time,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn is_connected(&self) -> bool {
        self.reconnect.is_connected()
    }

    pub fn sync_status(&self, doc: &DocId) -> SyncStatus {
        self.session.status(doc)
    }

    pub fn frontier(&self, doc: &DocId) -> Result<VectorClock> {
        Ok(self.registry.get(doc)?.frontier.clone())
    }

    pub fn pending_len(&self, doc: &DocId) -> usize {
        self.queue.len_for(doc)
    }

    /// This tab's identity on the broadcast channel.
    pub fn tab_id(&self) -> u64 {
        self.tabs.tab_id()
    }

    /// Whether this tab currently owns network sync for the document.
    pub fn is_sync_leader(&self, doc: &DocId) -> bool {
        self.tabs.is_leader(doc)
    }

    /// Ops the server refused since the last call.
    pub fn take_rejected(&mut self) -> Vec<RejectedOp> {
        self.queue.take_rejected()
    }

    // ----- registry ---------------------------------------------------

    /// Open (load or create) a document and claim network ownership of it
    /// among sibling tabs.
    pub fn open(&mut self, doc: &DocId, kind: CrdtKind) -> Result<()> {
        self.registry.open(&self.storage, doc, kind)?;
        let claim = self.tabs.claim(doc);
        let _ = self.broadcast.publish(message::encode(&claim));
        Ok(())
    }

    pub fn open_document(&mut self, doc: &DocId) -> Result<()> {
        self.open(doc, CrdtKind::Document)
    }

    pub fn open_text(&mut self, doc: &DocId) -> Result<()> {
        self.open(doc, CrdtKind::Text)
    }

    pub fn open_rich_text(&mut self, doc: &DocId) -> Result<()> {
        self.open(doc, CrdtKind::RichText)
    }

    pub fn open_counter(&mut self, doc: &DocId) -> Result<()> {
        self.open(doc, CrdtKind::Counter)
    }

    pub fn open_set(&mut self, doc: &DocId) -> Result<()> {
        self.open(doc, CrdtKind::Set)
    }

    /// Register a change callback. Callbacks run after each visible change,
    /// never re-entrantly, and never observe an older state after a newer
    /// one.
    pub fn on_change(&mut self, doc: &DocId, callback: ChangeCallback) {
        self.subscribers.entry(doc.clone()).or_default().push(callback);
    }

    /// Recovery path for internal invariant violations: drop the in-memory
    /// document, reload the last persisted state, and ask the server for a
    /// full resync. Persistent state is never touched.
    pub fn reinitialize(&mut self, doc: &DocId) -> Result<()> {
        error!("[engine] re-initializing {doc} after an invariant violation");
        self.registry.reload(&self.storage, doc)?;
        let clock = self.registry.get(doc)?.frontier.clone();
        self.counters.resyncs_requested += 1;
        self.send_client(&ClientMessage::SyncRequest {
            doc: doc.clone(),
            clock,
        });
        self.notify(doc);
        Ok(())
    }

    // ----- replication ------------------------------------------------

    /// Track the document on the server. Emits the subscribe immediately
    /// when connected; otherwise the next reconnect carries it.
    pub fn subscribe(&mut self, doc: &DocId) -> Result<()> {
        let clock = self.registry.get(doc)?.frontier.clone();
        let messages = self.session.subscribe(doc, &clock);
        for msg in messages {
            self.send_client(&msg);
        }
        Ok(())
    }

    /// Stop tracking; also cancels an in-flight subscribe.
    pub fn unsubscribe(&mut self, doc: &DocId) {
        let messages = self.session.unsubscribe(doc);
        for msg in messages {
            self.send_client(&msg);
        }
    }

    // ----- LWW document -----------------------------------------------

    pub fn set_field(&mut self, doc: &DocId, field: &str, value: Value) -> Result<OpId> {
        let field = field.to_string();
        self.commit_local(doc, move |document, stamp, client| {
            match &mut document.state {
                DocumentState::Document(map) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Fields {
                        writes: vec![map.set(&field, value, stamp)],
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Document, other.kind())),
            }
        })
    }

    /// Partial-document update: every field shares one stamp but merges
    /// independently on remote replicas.
    pub fn set_fields(&mut self, doc: &DocId, entries: Vec<(String, Value)>) -> Result<OpId> {
        self.commit_local(doc, move |document, stamp, client| {
            match &mut document.state {
                DocumentState::Document(map) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Fields {
                        writes: map.set_many(entries, stamp),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Document, other.kind())),
            }
        })
    }

    pub fn delete_field(&mut self, doc: &DocId, field: &str) -> Result<OpId> {
        let field = field.to_string();
        self.commit_local(doc, move |document, stamp, client| {
            match &mut document.state {
                DocumentState::Document(map) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Fields {
                        writes: vec![map.delete(&field, stamp)],
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Document, other.kind())),
            }
        })
    }

    pub fn field(&self, doc: &DocId, field: &str) -> Result<Option<Value>> {
        match &self.registry.get(doc)?.state {
            DocumentState::Document(map) => Ok(map.get(field).cloned()),
            other => Err(wrong_kind(doc, CrdtKind::Document, other.kind())),
        }
    }

    pub fn fields(&self, doc: &DocId) -> Result<Vec<(String, Value)>> {
        match &self.registry.get(doc)?.state {
            DocumentState::Document(map) => Ok(map
                .entries()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()),
            other => Err(wrong_kind(doc, CrdtKind::Document, other.kind())),
        }
    }

    // ----- plain text -------------------------------------------------

    pub fn insert_text(&mut self, doc: &DocId, index: usize, content: &str) -> Result<OpId> {
        let content = content.to_string();
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Text(text) => {
                    if index > text.len() {
                        return Err(SyncError::Invariant(format!(
                            "insert index {index} past end {}",
                            text.len()
                        )));
                    }
                    let mut first = 0;
                    for i in 0..content.chars().count() {
                        let seq = document.frontier.increment(client);
                        if i == 0 {
                            first = seq;
                        }
                    }
                    Ok(DeltaPayload::Text {
                        ops: text.insert(index, &content, client, first),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Text, other.kind())),
            }
        })
    }

    pub fn delete_text(&mut self, doc: &DocId, index: usize, len: usize) -> Result<OpId> {
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Text(text) => {
                    if index + len > text.len() {
                        return Err(SyncError::Invariant(format!(
                            "delete range {index}+{len} past end {}",
                            text.len()
                        )));
                    }
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Text {
                        ops: text.delete(index, len),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Text, other.kind())),
            }
        })
    }

    pub fn text(&self, doc: &DocId) -> Result<String> {
        match &self.registry.get(doc)?.state {
            DocumentState::Text(text) => Ok(text.text()),
            other => Err(wrong_kind(doc, CrdtKind::Text, other.kind())),
        }
    }

    // ----- rich text --------------------------------------------------

    pub fn insert_rich_text(&mut self, doc: &DocId, index: usize, content: &str) -> Result<OpId> {
        let content = content.to_string();
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::RichText(rich) => {
                    if index > rich.len() {
                        return Err(SyncError::Invariant(format!(
                            "insert index {index} past end {}",
                            rich.len()
                        )));
                    }
                    let mut first = 0;
                    for i in 0..content.chars().count() {
                        let seq = document.frontier.increment(client);
                        if i == 0 {
                            first = seq;
                        }
                    }
                    Ok(DeltaPayload::RichText {
                        ops: rich.insert(index, &content, client, first),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::RichText, other.kind())),
            }
        })
    }

    pub fn delete_rich_text(&mut self, doc: &DocId, index: usize, len: usize) -> Result<OpId> {
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::RichText(rich) => {
                    if index + len > rich.len() {
                        return Err(SyncError::Invariant(format!(
                            "delete range {index}+{len} past end {}",
                            rich.len()
                        )));
                    }
                    document.frontier.increment(client);
                    Ok(DeltaPayload::RichText {
                        ops: rich.delete(index, len),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::RichText, other.kind())),
            }
        })
    }

    pub fn format(
        &mut self,
        doc: &DocId,
        start: usize,
        end: usize,
        attr: &str,
        value: Value,
    ) -> Result<OpId> {
        let attr = attr.to_string();
        self.commit_local(doc, move |document, stamp, client| {
            match &mut document.state {
                DocumentState::RichText(rich) => {
                    let seq = document.frontier.increment(client);
                    let span_id = OpId::new(client, seq);
                    Ok(DeltaPayload::RichText {
                        ops: rich.format(start, end, &attr, value, span_id, stamp),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::RichText, other.kind())),
            }
        })
    }

    pub fn unformat(&mut self, doc: &DocId, start: usize, end: usize, attr: &str) -> Result<OpId> {
        let attr = attr.to_string();
        self.commit_local(doc, move |document, stamp, client| {
            match &mut document.state {
                DocumentState::RichText(rich) => {
                    let seq = document.frontier.increment(client);
                    let span_id = OpId::new(client, seq);
                    Ok(DeltaPayload::RichText {
                        ops: rich.unformat(start, end, &attr, span_id, stamp),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::RichText, other.kind())),
            }
        })
    }

    pub fn rich_text(&self, doc: &DocId) -> Result<String> {
        match &self.registry.get(doc)?.state {
            DocumentState::RichText(rich) => Ok(rich.text()),
            other => Err(wrong_kind(doc, CrdtKind::RichText, other.kind())),
        }
    }

    pub fn rich_text_runs(&self, doc: &DocId) -> Result<Vec<(String, AttrMap)>> {
        match &self.registry.get(doc)?.state {
            DocumentState::RichText(rich) => Ok(rich.runs()),
            other => Err(wrong_kind(doc, CrdtKind::RichText, other.kind())),
        }
    }

    // ----- counter ----------------------------------------------------

    pub fn increment(&mut self, doc: &DocId, n: u64) -> Result<OpId> {
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Counter(counter) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Counter {
                        delta: counter.increment(client, n),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Counter, other.kind())),
            }
        })
    }

    pub fn decrement(&mut self, doc: &DocId, n: u64) -> Result<OpId> {
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Counter(counter) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Counter {
                        delta: counter.decrement(client, n),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Counter, other.kind())),
            }
        })
    }

    pub fn counter_value(&self, doc: &DocId) -> Result<i64> {
        match &self.registry.get(doc)?.state {
            DocumentState::Counter(counter) => Ok(counter.value()),
            other => Err(wrong_kind(doc, CrdtKind::Counter, other.kind())),
        }
    }

    // ----- set --------------------------------------------------------

    pub fn set_add(&mut self, doc: &DocId, element: &str) -> Result<OpId> {
        let element = element.to_string();
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Set(set) => {
                    let seq = document.frontier.increment(client);
                    Ok(DeltaPayload::Set {
                        delta: set.add(&element, OpId::new(client, seq)),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Set, other.kind())),
            }
        })
    }

    pub fn set_remove(&mut self, doc: &DocId, element: &str) -> Result<OpId> {
        let element = element.to_string();
        self.commit_local(doc, move |document, _stamp, client| {
            match &mut document.state {
                DocumentState::Set(set) => {
                    document.frontier.increment(client);
                    Ok(DeltaPayload::Set {
                        delta: set.remove(&element),
                    })
                }
                other => Err(wrong_kind(&document.id, CrdtKind::Set, other.kind())),
            }
        })
    }

    pub fn set_contains(&self, doc: &DocId, element: &str) -> Result<bool> {
        match &self.registry.get(doc)?.state {
            DocumentState::Set(set) => Ok(set.contains(element)),
            other => Err(wrong_kind(doc, CrdtKind::Set, other.kind())),
        }
    }

    pub fn set_elements(&self, doc: &DocId) -> Result<Vec<String>> {
        match &self.registry.get(doc)?.state {
            DocumentState::Set(set) => {
                Ok(set.elements().into_iter().map(str::to_string).collect())
            }
            other => Err(wrong_kind(doc, CrdtKind::Set, other.kind())),
        }
    }

    // ----- awareness ----------------------------------------------------

    /// Enable presence for a document and subscribe on the server.
    pub fn subscribe_awareness(&mut self, doc: &DocId) -> Result<()> {
        self.registry.get(doc)?;
        let client = self.client;
        self.awareness
            .entry(doc.clone())
            .or_insert_with(|| Awareness::new(doc.clone(), client));
        let messages = self.session.subscribe_awareness(doc);
        for msg in messages {
            self.send_client(&msg);
        }
        Ok(())
    }

    pub fn awareness_set_local(&mut self, doc: &DocId, state: AwarenessStateMap) -> Result<()> {
        let now = self.time.now_ms();
        let awareness = self.awareness.get_mut(doc).ok_or_else(|| {
            SyncError::Invariant(format!("awareness not enabled for {doc}"))
        })?;
        let update = awareness.set_local_state(state, now);
        self.send_client(&ClientMessage::AwarenessUpdate { update });
        Ok(())
    }

    pub fn awareness_states(&self, doc: &DocId) -> Vec<&AwarenessEntry> {
        self.awareness
            .get(doc)
            .map(|a| a.states().collect())
            .unwrap_or_default()
    }

    // ----- connectivity -----------------------------------------------

    /// The transport adapter established a connection: re-subscribe every
    /// tracked document with its local frontier. The pending queue replays
    /// per document once its sync response lands.
    pub fn on_connected(&mut self) -> Result<()> {
        let now = self.time.now_ms();
        self.reconnect.on_connected(now);
        let registry = &self.registry;
        let messages = self.session.on_connected(|doc| {
            registry
                .get(doc)
                .map(|d| d.frontier.clone())
                .unwrap_or_default()
        });
        for msg in messages {
            self.send_client(&msg);
        }
        Ok(())
    }

    /// The transport adapter lost the connection. Pending ops stay queued;
    /// nothing is lost.
    pub fn on_disconnected(&mut self) {
        let now = self.time.now_ms();
        self.session.on_disconnected();
        self.reconnect.on_disconnected(now);
    }

    /// Timer tick: drives backoff, heartbeats, pong deadlines and awareness
    /// maintenance.
    pub fn on_tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.closed {
            return outcome;
        }
        let now = self.time.now_ms();
        match self.reconnect.on_tick(now) {
            Some(TickAction::Reconnect) => outcome.reconnect_due = true,
            Some(TickAction::Ping) => self.send_client(&ClientMessage::Ping),
            Some(TickAction::ConnectionLost) => {
                warn!("[engine] heartbeat deadline missed, dropping connection");
                self.counters.transport_errors += 1;
                self.session.on_disconnected();
                self.reconnect.on_disconnected(now);
            }
            None => {}
        }

        for awareness in self.awareness.values_mut() {
            awareness.evict_stale(now);
        }
        if now >= self.next_awareness_beat_ms {
            self.next_awareness_beat_ms = now + AWARENESS_HEARTBEAT_MS;
            if self.reconnect.is_connected() {
                let updates: Vec<AwarenessUpdate> = self
                    .awareness
                    .values_mut()
                    .filter_map(|a| a.heartbeat(now))
                    .collect();
                for update in updates {
                    self.send_client(&ClientMessage::AwarenessUpdate { update });
                }
            }
        }
        outcome
    }

    /// Clean shutdown: leave presence, release tab leadership, cancel all
    /// retries. The queue is already durable; nothing further is sent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.reconnect.is_connected() {
            let updates: Vec<AwarenessUpdate> =
                self.awareness.values().map(|a| a.leave_update()).collect();
            for update in updates {
                self.send_client(&ClientMessage::AwarenessUpdate { update });
            }
        }
        let led: Vec<DocId> = self
            .registry
            .ids()
            .filter(|doc| self.tabs.is_leader(doc))
            .cloned()
            .collect();
        for doc in led {
            let release = self.tabs.release(&doc);
            let _ = self.broadcast.publish(message::encode(&release));
        }
        self.reconnect.close();
        self.session.on_disconnected();
        self.closed = true;
    }

    // ----- inbound ----------------------------------------------------

    /// One inbound transport frame. Undecodable frames and per-delta
    /// protocol faults are absorbed (logged and counted); storage and
    /// invariant failures surface.
    pub fn handle_message(&mut self, frame: &[u8]) -> Result<()> {
        let now = self.time.now_ms();
        self.reconnect.note_activity(now);
        let msg = match message::decode_server(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[engine] dropping inbound frame: {e}");
                self.counters.protocol_errors += 1;
                return Ok(());
            }
        };
        match msg {
            ServerMessage::SyncResponse {
                doc,
                deltas,
                frontier,
            } => self.handle_sync_response(doc, deltas, frontier),
            ServerMessage::Delta { delta } => self.apply_remote_delta(&delta).map(|_| ()),
            ServerMessage::Ack { op } => {
                if !self.queue.ack(&mut self.storage, &op)? {
                    self.counters.duplicate_acks += 1;
                }
                Ok(())
            }
            ServerMessage::AwarenessUpdate { update } => {
                self.apply_awareness(update);
                Ok(())
            }
            ServerMessage::AwarenessState { doc, entries } => {
                for entry in entries {
                    self.apply_awareness(AwarenessUpdate {
                        doc: doc.clone(),
                        client: entry.client,
                        state: entry.state,
                        clock: entry.clock,
                    });
                }
                Ok(())
            }
            ServerMessage::Pong => Ok(()),
            ServerMessage::Error { op, code, message } => {
                match code {
                    ErrorCode::Unauthorized | ErrorCode::QuotaExceeded => {
                        error!("[engine] server rejected op {op:?}: {message}");
                        if let Some(op) = op {
                            self.queue.reject(&mut self.storage, &op, &message)?;
                        }
                    }
                    ErrorCode::BadRequest | ErrorCode::Internal => {
                        warn!("[engine] server error ({code:?}): {message}");
                        self.counters.protocol_errors += 1;
                    }
                }
                Ok(())
            }
        }
    }

    fn handle_sync_response(
        &mut self,
        doc: DocId,
        deltas: Vec<Delta>,
        frontier: VectorClock,
    ) -> Result<()> {
        if !self.session.on_sync_response(&doc) {
            return Ok(());
        }
        debug!("[engine] sync response for {doc}: {} deltas", deltas.len());
        // Server order; correctness does not depend on it.
        for delta in &deltas {
            self.apply_remote_delta(delta)?;
        }
        {
            let document = self.registry.get_mut(&doc)?;
            document.frontier.merge(&frontier);
        }
        self.persist_document(&doc)?;
        // Replay the pending log in issuance order before anything new goes
        // out.
        let replays = self.queue.replay_for(&doc);
        if !replays.is_empty() {
            debug!("[engine] replaying {} pending ops for {doc}", replays.len());
        }
        for delta in replays {
            self.send_client(&ClientMessage::Delta { delta });
        }
        Ok(())
    }

    /// One broadcast-channel frame from a sibling tab.
    pub fn handle_broadcast(&mut self, frame: &[u8]) -> Result<()> {
        let msg = match serde_json::from_slice::<TabMessage>(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[engine] dropping broadcast frame: {e}");
                self.counters.protocol_errors += 1;
                return Ok(());
            }
        };
        match self.tabs.on_message(msg) {
            Some(TabEvent::ApplySibling { doc, op }) => self.apply_sibling(&doc, &op),
            Some(TabEvent::LeadershipLost { doc }) => {
                debug!("[engine] lost sync leadership of {doc}");
                Ok(())
            }
            Some(TabEvent::ReassertClaim { doc }) => {
                let claim = self.tabs.claim(&doc);
                let _ = self.broadcast.publish(message::encode(&claim));
                Ok(())
            }
            Some(TabEvent::LeaderVacated { doc }) => {
                if self.registry.contains(&doc) {
                    let claim = self.tabs.claim(&doc);
                    let _ = self.broadcast.publish(message::encode(&claim));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ----- internals --------------------------------------------------

    /// The single local-mutation path: capacity gate, stamp, mutate,
    /// persist, enqueue, notify, then wire and fan-out.
    fn commit_local<F>(&mut self, doc: &DocId, mutate: F) -> Result<OpId>
    where
        F: FnOnce(&mut registry::Document, HybridTimestamp, ClientId) -> Result<DeltaPayload>,
    {
        if self.closed {
            return Err(SyncError::Invariant("engine is closed".into()));
        }
        if !self.queue.has_capacity(doc) {
            return Err(SyncError::QueueFull { doc: doc.clone() });
        }
        let now = self.time.now_ms();
        let stamp = self.hlc.issue(now);
        let client = self.client;
        let (payload, clock) = {
            let document = self.registry.get_mut(doc)?;
            if document.degraded {
                return Err(SyncError::Storage(format!(
                    "document {doc} is degraded (read-only)"
                )));
            }
            let payload = mutate(document, stamp, client)?;
            (payload, document.frontier.clone())
        };
        let op = OpId::new(client, stamp.wall_ms);
        let delta = Delta {
            doc: doc.clone(),
            op,
            origin: client,
            stamp,
            clock,
            payload,
        };
        self.persist_document(doc)?;
        self.queue.enqueue(
            &mut self.storage,
            PendingOp {
                op,
                doc: doc.clone(),
                delta: delta.clone(),
                enqueued_at_ms: now,
                attempts: 0,
            },
        )?;
        self.notify(doc);
        if self.session.ready_to_send(doc) && self.tabs.is_leader(doc) {
            self.send_client(&ClientMessage::Delta { delta });
        }
        let frame = message::encode(&self.tabs.commit_message(doc, op));
        let _ = self.broadcast.publish(frame);
        Ok(op)
    }

    /// Merge one remote delta: idempotent at every layer. Returns whether
    /// the observable state changed.
    fn apply_remote_delta(&mut self, delta: &Delta) -> Result<bool> {
        if !self.registry.contains(&delta.doc) {
            debug!("[engine] delta for unopened document {}", delta.doc);
            return Ok(false);
        }
        if self.tabs.seen(&delta.op) {
            self.counters.duplicate_deltas += 1;
            return Ok(false);
        }
        let apply_result = {
            let document = self.registry.get_mut(&delta.doc)?;
            if document.degraded {
                warn!("[engine] ignoring delta for degraded document {}", delta.doc);
                return Ok(false);
            }
            document.state.apply(&delta.doc, &delta.payload)
        };
        let changed = match apply_result {
            Ok(changed) => {
                let document = self.registry.get_mut(&delta.doc)?;
                document.frontier.merge(&delta.clock);
                debug_assert!(document.frontier.dominates(&delta.clock));
                changed
            }
            Err(SyncError::Protocol { doc, reason }) => {
                // Discard the one delta and ask for a full resync.
                warn!("[engine] protocol fault on {doc}: {reason}");
                self.counters.protocol_errors += 1;
                self.counters.resyncs_requested += 1;
                let clock = self.registry.get(&doc)?.frontier.clone();
                self.send_client(&ClientMessage::SyncRequest { doc, clock });
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.persist_document(&delta.doc)?;
        let frame = message::encode(&self.tabs.commit_message(&delta.doc, delta.op));
        let _ = self.broadcast.publish(frame);
        if changed {
            self.notify(&delta.doc);
        }
        Ok(changed)
    }

    /// Apply a sibling tab's committed delta out of shared storage. The
    /// committing tab already persisted; this tab only refreshes memory and
    /// notifies.
    fn apply_sibling(&mut self, doc: &DocId, op: &OpId) -> Result<()> {
        if !self.registry.contains(doc) {
            return Ok(());
        }
        let pending = self
            .storage
            .get(&keys::pending(doc, op))?
            .and_then(|bytes| serde_json::from_slice::<PendingOp>(&bytes).ok());
        let changed = match pending {
            Some(pending) => {
                let document = self.registry.get_mut(doc)?;
                let changed = match document.state.apply(doc, &pending.delta.payload) {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!("[engine] sibling delta fault on {doc}: {e}");
                        self.counters.protocol_errors += 1;
                        false
                    }
                };
                document.frontier.merge(&pending.delta.clock);
                changed
            }
            None => {
                // Delta already acked or batched away: fall back to merging
                // the shared persisted state wholesale.
                let Some(bytes) = self.storage.get(&keys::doc(doc))? else {
                    return Ok(());
                };
                let loaded: DocumentState = decode_versioned(&bytes)?;
                let payload = loaded.snapshot_payload();
                let frontier = match self.storage.get(&keys::frontier(doc))? {
                    Some(bytes) => decode_versioned::<VectorClock>(&bytes)?,
                    None => VectorClock::new(),
                };
                let document = self.registry.get_mut(doc)?;
                let changed = match document.state.apply(doc, &payload) {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!("[engine] sibling state merge fault on {doc}: {e}");
                        self.counters.protocol_errors += 1;
                        false
                    }
                };
                document.frontier.merge(&frontier);
                changed
            }
        };
        if changed {
            self.notify(doc);
        }
        Ok(())
    }

    fn apply_awareness(&mut self, update: AwarenessUpdate) {
        let now = self.time.now_ms();
        if let Some(awareness) = self.awareness.get_mut(&update.doc) {
            awareness.apply_update(&update, now);
        }
    }

    fn notify(&mut self, doc: &DocId) {
        let Some(callbacks) = self.subscribers.get_mut(doc) else {
            return;
        };
        let Ok(document) = self.registry.get(doc) else {
            return;
        };
        for callback in callbacks.iter_mut() {
            callback(&document.state);
        }
    }

    fn send_client(&mut self, msg: &ClientMessage) {
        if !self.reconnect.is_connected() {
            return;
        }
        let frame = message::encode(msg);
        if let Err(e) = self.transport.send(frame) {
            warn!("[engine] send failed, dropping connection: {e}");
            self.counters.transport_errors += 1;
            let now = self.time.now_ms();
            self.session.on_disconnected();
            self.reconnect.on_disconnected(now);
        }
    }

    /// Persist state and frontier with bounded retries; a persistent
    /// failure degrades the document to read-only.
    fn persist_document(&mut self, doc: &DocId) -> Result<()> {
        let (state_bytes, frontier_bytes) = {
            let document = self.registry.get(doc)?;
            (
                encode_versioned(&document.state)?,
                encode_versioned(&document.frontier)?,
            )
        };
        let result = self
            .put_retry(&keys::doc(doc), &state_bytes)
            .and_then(|()| self.put_retry(&keys::frontier(doc), &frontier_bytes));
        if let Err(e) = result {
            error!("[engine] persisting {doc} failed, degrading to read-only: {e}");
            if let Ok(document) = self.registry.get_mut(doc) {
                document.degraded = true;
            }
            return Err(e);
        }
        Ok(())
    }

    fn put_retry(&mut self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..STORAGE_RETRIES {
            match self.storage.put(key, bytes) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt + 1 < STORAGE_RETRIES {
                        self.counters.storage_retries += 1;
                    }
                    warn!("[engine] put {key} failed (attempt {}): {e}", attempt + 1);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::Storage(format!("put {key} failed"))))
    }
}

fn wrong_kind(doc: &DocId, expected: CrdtKind, actual: CrdtKind) -> SyncError {
    SyncError::Invariant(format!(
        "document {doc} is a {actual:?}, operation needs {expected:?}"
    ))
}
