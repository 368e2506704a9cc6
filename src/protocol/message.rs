//! Wire messages. The core emits and accepts these as opaque payloads; a
//! wire adapter owns framing and transport headers. JSON with an internal
//! `type` tag keeps the vocabulary inspectable and forward-extensible.

use serde::{Deserialize, Serialize};

use crate::clocks::vector_clock::VectorClock;
use crate::crdt::{Delta, OpId};
use crate::error::{Result, SyncError};
use crate::protocol::awareness::{AwarenessEntry, AwarenessUpdate};
use crate::DocId;

/// Replica → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe { doc: DocId },
    Unsubscribe { doc: DocId },
    SyncRequest { doc: DocId, clock: VectorClock },
    Delta { delta: Delta },
    AwarenessSubscribe { doc: DocId },
    AwarenessUpdate { update: AwarenessUpdate },
    Ping,
}

/// Server → replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    SyncResponse {
        doc: DocId,
        deltas: Vec<Delta>,
        frontier: VectorClock,
    },
    Delta {
        delta: Delta,
    },
    Ack {
        op: OpId,
    },
    AwarenessUpdate {
        update: AwarenessUpdate,
    },
    AwarenessState {
        doc: DocId,
        entries: Vec<AwarenessEntry>,
    },
    Pong,
    Error {
        op: Option<OpId>,
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    Unauthorized,
    QuotaExceeded,
    BadRequest,
    Internal,
}

pub fn encode<T: Serialize>(message: &T) -> Vec<u8> {
    // The vocabulary serializes infallibly; adapters may re-frame at will.
    serde_json::to_vec(message).unwrap_or_default()
}

pub fn decode_server(frame: &[u8]) -> Result<ServerMessage> {
    serde_json::from_slice(frame).map_err(|e| SyncError::Protocol {
        doc: String::new(),
        reason: format!("undecodable server message: {e}"),
    })
}

pub fn decode_client(frame: &[u8]) -> Result<ClientMessage> {
    serde_json::from_slice(frame).map_err(|e| SyncError::Protocol {
        doc: String::new(),
        reason: format!("undecodable client message: {e}"),
    })
}
