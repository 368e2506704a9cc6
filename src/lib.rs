//! SyncKit: a local-first synchronization core.
//!
//! The crate is layered bottom-up: [`clocks`] provides identity and causality
//! primitives, [`crdt`] the five convergent data types, [`protocol`] the wire
//! vocabulary and per-document replication state machines, and [`engine`] the
//! replica facade that wires documents, the durable offline queue, the
//! reconnect machinery and cross-tab fan-out together behind injected ports.

pub mod clocks;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod ports;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod tabs;

pub use clocks::client_id::ClientId;
pub use clocks::hybrid::{HybridClock, HybridTimestamp};
pub use clocks::vector_clock::{Causality, VectorClock};
pub use crdt::{CrdtKind, Delta, DeltaPayload, OpId};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};

/// The namespacing unit for subscription, storage and fan-out.
pub type DocId = String;
