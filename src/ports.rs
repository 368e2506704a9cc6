//! Ports the core consumes. Each replica instance owns its ports; adapters
//! map them onto IndexedDB/SQLite, WebSocket framing, or a browser broadcast
//! channel. The in-memory implementations below back the test suite and any
//! host that wants a purely local replica.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SyncError};

/// Key/value storage. Writes are atomic per key; keys are opaque to the
/// adapter. The core uses the namespaces `meta/`, `doc/`, `frontier/` and
/// `pending/`.
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Outbound half of the wire. Framing, headers and the socket itself live in
/// the adapter; the core hands it encoded message payloads and learns about
/// connectivity through `SyncEngine::on_connected` / `on_disconnected`.
pub trait Transport {
    fn send(&mut self, frame: Vec<u8>) -> Result<()>;
}

/// Best-effort same-origin broadcast to sibling tabs. Lossy by contract:
/// consumers recover missed frames by re-reading storage.
pub trait Broadcast {
    fn publish(&mut self, frame: Vec<u8>) -> Result<()>;
}

/// Wall clock observation. Injected so tests drive time deterministically.
pub trait TimeSource {
    fn now_ms(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// In-memory storage. A `BTreeMap` keeps prefix scans ordered, which gives
/// the offline queue its issuance-order recovery for free.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
    fail_puts: u32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail, for exercising the retry/degrade path.
    pub fn fail_next_puts(&mut self, n: u32) {
        self.fail_puts = n;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_puts > 0 {
            self.fail_puts -= 1;
            return Err(SyncError::Storage(format!("injected put failure for {key}")));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Transport fake that records every outgoing frame and can simulate a dead
/// wire.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<Vec<u8>>,
    pub broken: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        if self.broken {
            return Err(SyncError::Transport("wire is down".into()));
        }
        self.sent.push(frame);
        Ok(())
    }
}

/// Broadcast fake: frames accumulate until the harness relays them to the
/// sibling replicas.
#[derive(Debug, Default)]
pub struct RecordingBroadcast {
    pub published: Vec<Vec<u8>>,
}

impl RecordingBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.published)
    }
}

impl Broadcast for RecordingBroadcast {
    fn publish(&mut self, frame: Vec<u8>) -> Result<()> {
        self.published.push(frame);
        Ok(())
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Rc<RefCell<u64>>,
}

impl ManualTimeSource {
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: Rc::new(RefCell::new(now_ms)),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        *self.now.borrow_mut() += delta_ms;
    }

    pub fn set(&self, now_ms: u64) {
        *self.now.borrow_mut() = now_ms;
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        *self.now.borrow()
    }
}

// Tabs of the same origin share one underlying store, so the ports are also
// implemented for shared handles.
impl<S: Storage> Storage for Rc<RefCell<S>> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.borrow().get(key)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.borrow_mut().put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.borrow_mut().delete(key)
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.borrow().list_prefix(prefix)
    }
}

impl<T: Transport> Transport for Rc<RefCell<T>> {
    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.borrow_mut().send(frame)
    }
}

impl<B: Broadcast> Broadcast for Rc<RefCell<B>> {
    fn publish(&mut self, frame: Vec<u8>) -> Result<()> {
        self.borrow_mut().publish(frame)
    }
}
