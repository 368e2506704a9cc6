//! The five convergent data types and the delta vocabulary they share.
//!
//! Engines are plain structs: local mutators return typed deltas (they never
//! touch the network), `apply` absorbs a delta commutatively and
//! idempotently, and a query surface reads the converged state. The engine
//! layer wraps typed deltas into [`Delta`] envelopes for replication.

pub mod fugue;
pub mod lww_map;
pub mod or_set;
pub mod peritext;
pub mod pn_counter;
pub mod test_util;

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::clocks::client_id::ClientId;
use crate::clocks::hybrid::HybridTimestamp;
use crate::clocks::vector_clock::VectorClock;
use crate::error::{Result, SyncError};
use crate::DocId;

use fugue::{FugueText, TextOp};
use lww_map::{FieldWrite, LwwMap};
use or_set::{OrSet, SetDelta};
use peritext::{RichText, RichTextOp};
use pn_counter::{CounterDelta, PnCounter};

/// Unique per-replica operation identifier; together with the issuing client
/// it is the fingerprint unit for every dedup path in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub client: ClientId,
    pub seq: u64,
}

impl OpId {
    pub fn new(client: ClientId, seq: u64) -> Self {
        Self { client, seq }
    }

    /// Zero-padded form so lexicographic storage-key order matches issuance
    /// order for a single replica.
    pub fn storage_key(&self) -> String {
        format!("{}-{:020}", self.client.to_hex(), self.seq)
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.seq)
    }
}

/// Discriminant of the five document kinds the registry can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrdtKind {
    Document,
    Text,
    RichText,
    Counter,
    Set,
}

/// Typed delta body, one variant per document kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DeltaPayload {
    Fields { writes: Vec<FieldWrite> },
    Text { ops: Vec<TextOp> },
    RichText { ops: Vec<RichTextOp> },
    Counter { delta: CounterDelta },
    Set { delta: SetDelta },
}

impl DeltaPayload {
    pub fn kind(&self) -> CrdtKind {
        match self {
            DeltaPayload::Fields { .. } => CrdtKind::Document,
            DeltaPayload::Text { .. } => CrdtKind::Text,
            DeltaPayload::RichText { .. } => CrdtKind::RichText,
            DeltaPayload::Counter { .. } => CrdtKind::Counter,
            DeltaPayload::Set { .. } => CrdtKind::Set,
        }
    }
}

/// The replicated unit: a typed payload plus the causal metadata the
/// replication protocol carries for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub doc: DocId,
    pub op: OpId,
    pub origin: ClientId,
    pub stamp: HybridTimestamp,
    pub clock: VectorClock,
    pub payload: DeltaPayload,
}

/// State of one document, dispatched over the five kinds without trait
/// objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DocumentState {
    Document(LwwMap),
    Text(FugueText),
    RichText(RichText),
    Counter(PnCounter),
    Set(OrSet),
}

impl DocumentState {
    pub fn new(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::Document => DocumentState::Document(LwwMap::new()),
            CrdtKind::Text => DocumentState::Text(FugueText::new()),
            CrdtKind::RichText => DocumentState::RichText(RichText::new()),
            CrdtKind::Counter => DocumentState::Counter(PnCounter::new()),
            CrdtKind::Set => DocumentState::Set(OrSet::new()),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            DocumentState::Document(_) => CrdtKind::Document,
            DocumentState::Text(_) => CrdtKind::Text,
            DocumentState::RichText(_) => CrdtKind::RichText,
            DocumentState::Counter(_) => CrdtKind::Counter,
            DocumentState::Set(_) => CrdtKind::Set,
        }
    }

    /// The whole state as a single payload, used for sync responses, state
    /// transfer between tabs, and re-initialization after an invariant
    /// breach.
    pub fn snapshot_payload(&self) -> DeltaPayload {
        match self {
            DocumentState::Document(state) => DeltaPayload::Fields {
                writes: state.snapshot_writes(),
            },
            DocumentState::Text(state) => DeltaPayload::Text {
                ops: state.snapshot_ops(),
            },
            DocumentState::RichText(state) => DeltaPayload::RichText {
                ops: state.snapshot_ops(),
            },
            DocumentState::Counter(state) => DeltaPayload::Counter {
                delta: state.snapshot(),
            },
            DocumentState::Set(state) => DeltaPayload::Set {
                delta: state.snapshot(),
            },
        }
    }

    /// Apply a payload of the matching kind. Returns whether the observable
    /// state changed; applying the same payload twice is a no-op.
    pub fn apply(&mut self, doc: &DocId, payload: &DeltaPayload) -> Result<bool> {
        match (self, payload) {
            (DocumentState::Document(state), DeltaPayload::Fields { writes }) => {
                let mut changed = false;
                for write in writes {
                    changed |= state.apply(write);
                }
                Ok(changed)
            }
            (DocumentState::Text(state), DeltaPayload::Text { ops }) => {
                let mut changed = false;
                for op in ops {
                    changed |= state.apply(op.clone()).map_err(|reason| {
                        SyncError::Protocol {
                            doc: doc.clone(),
                            reason,
                        }
                    })?;
                }
                Ok(changed)
            }
            (DocumentState::RichText(state), DeltaPayload::RichText { ops }) => {
                let mut changed = false;
                for op in ops {
                    changed |= state.apply(op.clone()).map_err(|reason| {
                        SyncError::Protocol {
                            doc: doc.clone(),
                            reason,
                        }
                    })?;
                }
                Ok(changed)
            }
            (DocumentState::Counter(state), DeltaPayload::Counter { delta }) => {
                Ok(state.apply(delta))
            }
            (DocumentState::Set(state), DeltaPayload::Set { delta }) => Ok(state.apply(delta)),
            (state, payload) => Err(SyncError::Protocol {
                doc: doc.clone(),
                reason: format!(
                    "payload kind {:?} does not match document kind {:?}",
                    payload.kind(),
                    state.kind()
                ),
            }),
        }
    }
}
