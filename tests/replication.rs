//! Replication protocol scenarios against an in-process fake server:
//! subscribe/sync handshakes, delta fan-out, acknowledgements, offline
//! replay, rejections, resyncs and heartbeats.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::json;

use synckit::clocks::vector_clock::VectorClock;
use synckit::crdt::Delta;
use synckit::engine::registry::keys;
use synckit::engine::SyncEngine;
use synckit::ports::{ManualTimeSource, MemoryStorage, RecordingBroadcast, RecordingTransport, Storage};
use synckit::protocol::awareness::AwarenessUpdate;
use synckit::protocol::message::{decode_client, decode_server, encode, ClientMessage, ErrorCode, ServerMessage};
use synckit::protocol::session::SyncStatus;
use synckit::{ClientId, DocId};

type Store = Rc<RefCell<MemoryStorage>>;
type Wire = Rc<RefCell<RecordingTransport>>;
type Bus = Rc<RefCell<RecordingBroadcast>>;
type Engine = SyncEngine<Store, Wire, Bus, ManualTimeSource>;

struct Replica {
    engine: Engine,
    wire: Wire,
    #[allow(dead_code)]
    bus: Bus,
    time: ManualTimeSource,
}

fn replica(client: u128, now_ms: u64) -> Replica {
    let store: Store = Rc::new(RefCell::new(MemoryStorage::new()));
    store
        .borrow_mut()
        .put(&keys::client_id(), ClientId::new(client).to_hex().as_bytes())
        .unwrap();
    let wire: Wire = Rc::new(RefCell::new(RecordingTransport::new()));
    let bus: Bus = Rc::new(RefCell::new(RecordingBroadcast::new()));
    let time = ManualTimeSource::at(now_ms);
    let engine = SyncEngine::new(store, Rc::clone(&wire), Rc::clone(&bus), time.clone()).unwrap();
    Replica {
        engine,
        wire,
        bus,
        time,
    }
}

/// Minimal server: stores deltas FIFO per issuing replica, acks everything,
/// answers sync requests with its full log (idempotence absorbs the
/// overlap).
#[derive(Default)]
struct FakeServer {
    deltas: HashMap<DocId, Vec<Delta>>,
    frontiers: HashMap<DocId, VectorClock>,
    awareness: HashMap<DocId, Vec<AwarenessUpdate>>,
    /// Encoded `ServerMessage` frames to fan out to the other replicas.
    fanout: Vec<Vec<u8>>,
    reject_next_delta: Option<(ErrorCode, String)>,
}

impl FakeServer {
    fn handle(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        match decode_client(frame).unwrap() {
            ClientMessage::Subscribe { .. } | ClientMessage::Unsubscribe { .. } => Vec::new(),
            ClientMessage::SyncRequest { doc, .. } => {
                vec![encode(&ServerMessage::SyncResponse {
                    deltas: self.deltas.get(&doc).cloned().unwrap_or_default(),
                    frontier: self.frontiers.get(&doc).cloned().unwrap_or_default(),
                    doc,
                })]
            }
            ClientMessage::Delta { delta } => {
                if let Some((code, message)) = self.reject_next_delta.take() {
                    return vec![encode(&ServerMessage::Error {
                        op: Some(delta.op),
                        code,
                        message,
                    })];
                }
                self.frontiers
                    .entry(delta.doc.clone())
                    .or_default()
                    .merge(&delta.clock);
                let log = self.deltas.entry(delta.doc.clone()).or_default();
                if !log.iter().any(|d| d.op == delta.op) {
                    log.push(delta.clone());
                    self.fanout
                        .push(encode(&ServerMessage::Delta { delta: delta.clone() }));
                }
                vec![encode(&ServerMessage::Ack { op: delta.op })]
            }
            ClientMessage::AwarenessSubscribe { doc } => {
                vec![encode(&ServerMessage::AwarenessState {
                    entries: self
                        .awareness
                        .get(&doc)
                        .map(|updates| {
                            updates
                                .iter()
                                .map(|u| synckit::protocol::awareness::AwarenessEntry {
                                    client: u.client,
                                    state: u.state.clone(),
                                    clock: u.clock,
                                    last_seen_ms: 0,
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                    doc,
                })]
            }
            ClientMessage::AwarenessUpdate { update } => {
                let entries = self.awareness.entry(update.doc.clone()).or_default();
                entries.retain(|u| u.client != update.client);
                entries.push(update.clone());
                self.fanout
                    .push(encode(&ServerMessage::AwarenessUpdate { update }));
                Vec::new()
            }
            ClientMessage::Ping => vec![encode(&ServerMessage::Pong)],
        }
    }
}

/// Drain a replica's outgoing frames through the server until quiescent.
fn pump(replica: &mut Replica, server: &mut FakeServer) {
    loop {
        let frames = replica.wire.borrow_mut().drain();
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            for reply in server.handle(&frame) {
                replica.engine.handle_message(&reply).unwrap();
            }
        }
    }
}

/// Deliver everything the server wants to fan out to the given replicas.
fn fan_out(server: &mut FakeServer, replicas: &mut [&mut Replica]) {
    let frames = std::mem::take(&mut server.fanout);
    for frame in &frames {
        for replica in replicas.iter_mut() {
            replica.engine.handle_message(frame).unwrap();
        }
    }
}

fn doc() -> DocId {
    "notes".to_string()
}

fn connect_and_sync(replica: &mut Replica, server: &mut FakeServer) {
    replica.engine.on_connected().unwrap();
    replica.engine.subscribe(&doc()).unwrap();
    pump(replica, server);
    assert_eq!(replica.engine.sync_status(&doc()), SyncStatus::Synced);
}

#[test_log::test]
fn subscribe_handshake_reaches_synced() {
    let mut a = replica(1, 1_000);
    let mut server = FakeServer::default();

    a.engine.open_document(&doc()).unwrap();
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::NotTracked);

    a.engine.on_connected().unwrap();
    a.engine.subscribe(&doc()).unwrap();
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::Subscribing);

    pump(&mut a, &mut server);
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::Synced);
}

#[test_log::test]
fn deltas_fan_out_and_ack() {
    let mut a = replica(1, 1_000);
    let mut b = replica(2, 1_000);
    let mut server = FakeServer::default();

    for r in [&mut a, &mut b] {
        r.engine.open_counter(&doc()).unwrap();
        connect_and_sync(r, &mut server);
    }

    a.engine.increment(&doc(), 3).unwrap();
    assert_eq!(a.engine.pending_len(&doc()), 1);
    pump(&mut a, &mut server);
    // Acked: removed from the durable queue.
    assert_eq!(a.engine.pending_len(&doc()), 0);

    fan_out(&mut server, &mut [&mut b]);
    assert_eq!(b.engine.counter_value(&doc()).unwrap(), 3);
}

#[test_log::test]
fn remote_delta_advances_the_frontier() {
    let mut a = replica(1, 1_000);
    let mut b = replica(2, 1_000);
    let mut server = FakeServer::default();

    for r in [&mut a, &mut b] {
        r.engine.open_counter(&doc()).unwrap();
        connect_and_sync(r, &mut server);
    }

    a.engine.increment(&doc(), 1).unwrap();
    pump(&mut a, &mut server);

    // Inspect the fanned-out delta and check causal monotonicity on B.
    let frames = server.fanout.clone();
    fan_out(&mut server, &mut [&mut b]);
    for frame in frames {
        if let ServerMessage::Delta { delta } = decode_server(&frame).unwrap() {
            assert!(b.engine.frontier(&doc()).unwrap().dominates(&delta.clock));
        }
    }
}

#[test_log::test]
fn duplicate_delta_is_absorbed_silently() {
    let mut a = replica(1, 1_000);
    let mut b = replica(2, 1_000);
    let mut server = FakeServer::default();

    for r in [&mut a, &mut b] {
        r.engine.open_counter(&doc()).unwrap();
        connect_and_sync(r, &mut server);
    }

    a.engine.increment(&doc(), 5).unwrap();
    pump(&mut a, &mut server);

    let frames = std::mem::take(&mut server.fanout);
    for frame in &frames {
        b.engine.handle_message(frame).unwrap();
        b.engine.handle_message(frame).unwrap(); // duplicated delivery
    }
    assert_eq!(b.engine.counter_value(&doc()).unwrap(), 5);
    assert!(b.engine.counters().duplicate_deltas > 0);
}

#[test_log::test]
fn offline_mutations_replay_in_order_after_reconnect() {
    let mut a = replica(1, 2_000);
    let mut b = replica(2, 1_000);
    let mut server = FakeServer::default();

    // B is online from the start.
    b.engine.open_document(&doc()).unwrap();
    connect_and_sync(&mut b, &mut server);
    for i in 0..10 {
        b.engine
            .set_field(&doc(), &format!("f{i}"), json!("b"))
            .unwrap();
        b.time.advance(1);
    }
    pump(&mut b, &mut server);

    // A stays offline and writes over the same fields, later in wall time.
    a.engine.open_document(&doc()).unwrap();
    for i in 0..100 {
        a.engine
            .set_field(&doc(), &format!("f{i}"), json!("a"))
            .unwrap();
        a.time.advance(10);
    }
    assert_eq!(a.engine.pending_len(&doc()), 100);
    assert!(a.wire.borrow().sent.is_empty());

    // Reconnect: resync first, then the whole pending log replays in
    // issuance order, then acks drain the queue.
    a.engine.subscribe(&doc()).unwrap();
    a.engine.on_connected().unwrap();
    pump(&mut a, &mut server);
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::Synced);
    assert_eq!(a.engine.pending_len(&doc()), 0);

    // The server saw A's ops in issuance order.
    let a_client = a.engine.client_id();
    let seqs: Vec<u64> = server.deltas[&doc()]
        .iter()
        .filter(|d| d.origin == a_client)
        .map(|d| d.op.seq)
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert_eq!(seqs.len(), 100);

    fan_out(&mut server, &mut [&mut a, &mut b]);

    // No update lost, and A's later stamps win every contested field.
    let mut fields_a = a.engine.fields(&doc()).unwrap();
    let mut fields_b = b.engine.fields(&doc()).unwrap();
    fields_a.sort_by(|x, y| x.0.cmp(&y.0));
    fields_b.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(fields_a, fields_b);
    assert_eq!(fields_a.len(), 100);
    assert_eq!(a.engine.field(&doc(), "f3").unwrap(), Some(json!("a")));
}

#[test_log::test]
fn rejected_op_moves_aside_and_is_never_retried() {
    let mut a = replica(1, 1_000);
    let mut server = FakeServer::default();

    a.engine.open_counter(&doc()).unwrap();
    connect_and_sync(&mut a, &mut server);

    server.reject_next_delta = Some((ErrorCode::Unauthorized, "nope".into()));
    a.engine.increment(&doc(), 1).unwrap();
    pump(&mut a, &mut server);

    let rejected = a.engine.take_rejected();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].reason, "nope");
    assert_eq!(a.engine.pending_len(&doc()), 0);

    // A later resync replays nothing.
    a.engine.on_disconnected();
    a.engine.on_connected().unwrap();
    pump(&mut a, &mut server);
    assert!(server.deltas.get(&doc()).map_or(true, |log| log.is_empty()));
}

#[test_log::test]
fn mismatched_payload_triggers_a_full_resync() {
    let mut a = replica(1, 1_000);
    let mut server = FakeServer::default();

    a.engine.open_document(&doc()).unwrap();
    connect_and_sync(&mut a, &mut server);

    // A counter payload aimed at an LWW document is a protocol fault.
    let bogus = Delta {
        doc: doc(),
        op: synckit::OpId::new(ClientId::new(9), 1),
        origin: ClientId::new(9),
        stamp: synckit::HybridTimestamp {
            wall_ms: 1,
            client: ClientId::new(9),
        },
        clock: VectorClock::new(),
        payload: synckit::DeltaPayload::Counter {
            delta: Default::default(),
        },
    };
    a.engine
        .handle_message(&encode(&ServerMessage::Delta { delta: bogus }))
        .unwrap();

    assert_eq!(a.engine.counters().protocol_errors, 1);
    assert_eq!(a.engine.counters().resyncs_requested, 1);
    let frames = a.wire.borrow_mut().drain();
    assert!(frames.iter().any(|frame| matches!(
        decode_client(frame),
        Ok(ClientMessage::SyncRequest { .. })
    )));
}

#[test_log::test]
fn heartbeat_pings_and_dead_wire_reconnects() {
    let mut a = replica(1, 1_000);
    let mut server = FakeServer::default();

    a.engine.open_counter(&doc()).unwrap();
    connect_and_sync(&mut a, &mut server);

    // Idle past the heartbeat interval: a ping goes out; the pong keeps the
    // connection alive.
    a.time.set(31_000);
    assert!(!a.engine.on_tick().reconnect_due);
    let frames = a.wire.borrow_mut().drain();
    assert!(frames
        .iter()
        .any(|f| matches!(decode_client(f), Ok(ClientMessage::Ping))));
    for frame in &frames {
        for reply in server.handle(frame) {
            a.engine.handle_message(&reply).unwrap();
        }
    }
    assert!(a.engine.is_connected());

    // Next ping goes unanswered: the wire is declared dead, backoff starts,
    // and the due reconnect is reported to the host.
    a.time.set(62_000);
    a.engine.on_tick();
    a.wire.borrow_mut().drain(); // swallow the ping
    a.time.set(72_100);
    a.engine.on_tick();
    assert!(!a.engine.is_connected());
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::Offline);

    // Backoff base is 1 s with at most 1.5x jitter.
    a.time.set(73_700);
    assert!(a.engine.on_tick().reconnect_due);

    a.engine.on_connected().unwrap();
    pump(&mut a, &mut server);
    assert_eq!(a.engine.sync_status(&doc()), SyncStatus::Synced);
}

#[test_log::test]
fn awareness_round_trip_with_leave_on_close() {
    let mut a = replica(1, 1_000);
    let mut b = replica(2, 1_000);
    let mut server = FakeServer::default();

    for r in [&mut a, &mut b] {
        r.engine.open_document(&doc()).unwrap();
        connect_and_sync(r, &mut server);
        r.engine.subscribe_awareness(&doc()).unwrap();
        pump(r, &mut server);
    }

    let mut state = serde_json::Map::new();
    state.insert("cursor".into(), json!(7));
    a.engine.awareness_set_local(&doc(), state.clone()).unwrap();
    pump(&mut a, &mut server);
    fan_out(&mut server, &mut [&mut b]);

    let a_client = a.engine.client_id();
    let states = b.engine.awareness_states(&doc());
    let entry = states.iter().find(|e| e.client == a_client).unwrap();
    assert_eq!(entry.state, state);

    // Stale clock from the same replica is dropped.
    let stale = AwarenessUpdate {
        doc: doc(),
        client: a_client,
        state: serde_json::Map::new(),
        clock: 0,
    };
    b.engine
        .handle_message(&encode(&ServerMessage::AwarenessUpdate { update: stale }))
        .unwrap();
    let states = b.engine.awareness_states(&doc());
    assert_eq!(
        states.iter().find(|e| e.client == a_client).unwrap().state,
        state
    );

    // Clean shutdown announces the departure.
    a.engine.close();
    pump(&mut a, &mut server);
    fan_out(&mut server, &mut [&mut b]);
    assert!(b
        .engine
        .awareness_states(&doc())
        .iter()
        .all(|e| e.client != a_client));
}
