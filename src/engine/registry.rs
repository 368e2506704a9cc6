//! Typed document registry backed by the storage port.
//!
//! Documents are created or loaded through [`DocumentRegistry::open`]; the
//! registry refuses to reopen an id under a different kind. Persisted state
//! is wrapped in a versioned envelope so future layout changes can migrate
//! instead of corrupting.

use log::warn;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clocks::vector_clock::VectorClock;
use crate::crdt::{CrdtKind, DocumentState};
use crate::error::{Result, SyncError};
use crate::ports::Storage;
use crate::DocId;

pub const STATE_VERSION: u32 = 1;

/// Storage key layout. Keys are opaque to the adapter.
pub mod keys {
    use crate::crdt::OpId;
    use crate::DocId;

    pub fn client_id() -> String {
        "meta/clientId".to_string()
    }

    pub fn doc(doc: &DocId) -> String {
        format!("doc/{doc}")
    }

    pub fn frontier(doc: &DocId) -> String {
        format!("frontier/{doc}")
    }

    pub fn pending(doc: &DocId, op: &OpId) -> String {
        format!("pending/{doc}/{}", op.storage_key())
    }
}

/// Envelope around every persisted value.
#[derive(Debug, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub v: u32,
    pub data: T,
}

pub fn encode_versioned<T: Serialize>(data: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(&Versioned {
        v: STATE_VERSION,
        data,
    })
    .map_err(|e| SyncError::Storage(format!("encode state: {e}")))
}

pub fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: Versioned<T> = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Storage(format!("decode state: {e}")))?;
    if envelope.v != STATE_VERSION {
        return Err(SyncError::Storage(format!(
            "unsupported state version {} (expected {STATE_VERSION})",
            envelope.v
        )));
    }
    Ok(envelope.data)
}

/// One open document: CRDT state, its causal frontier, and the degraded
/// flag that makes it read-only after a persistent storage failure.
#[derive(Debug)]
pub struct Document {
    pub id: DocId,
    pub state: DocumentState,
    pub frontier: VectorClock,
    pub degraded: bool,
}

#[derive(Debug, Default)]
pub struct DocumentRegistry {
    docs: FxHashMap<DocId, Document>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (load or create) a document of the given kind.
    pub fn open(
        &mut self,
        storage: &impl Storage,
        doc: &DocId,
        kind: CrdtKind,
    ) -> Result<&mut Document> {
        if !self.docs.contains_key(doc) {
            let document = Self::load(storage, doc, kind)?;
            self.docs.insert(doc.clone(), document);
        }
        let document = self.docs.get_mut(doc).expect("inserted above");
        if document.state.kind() != kind {
            return Err(SyncError::Invariant(format!(
                "document {doc} is a {:?}, requested as {kind:?}",
                document.state.kind()
            )));
        }
        Ok(document)
    }

    fn load(storage: &impl Storage, doc: &DocId, kind: CrdtKind) -> Result<Document> {
        let state = match storage.get(&keys::doc(doc))? {
            Some(bytes) => decode_versioned::<DocumentState>(&bytes)?,
            None => DocumentState::new(kind),
        };
        let frontier = match storage.get(&keys::frontier(doc))? {
            Some(bytes) => decode_versioned::<VectorClock>(&bytes)?,
            None => VectorClock::new(),
        };
        Ok(Document {
            id: doc.clone(),
            state,
            frontier,
            degraded: false,
        })
    }

    /// Drop in-memory state and reload from storage. The recovery path for
    /// internal invariant violations; persistent state is never touched.
    pub fn reload(&mut self, storage: &impl Storage, doc: &DocId) -> Result<()> {
        let Some(existing) = self.docs.get(doc) else {
            return Err(SyncError::Invariant(format!("document {doc} is not open")));
        };
        let kind = existing.state.kind();
        warn!("[registry] re-initializing {doc} from storage");
        let document = Self::load(storage, doc, kind)?;
        self.docs.insert(doc.clone(), document);
        Ok(())
    }

    pub fn contains(&self, doc: &DocId) -> bool {
        self.docs.contains_key(doc)
    }

    pub fn get(&self, doc: &DocId) -> Result<&Document> {
        self.docs
            .get(doc)
            .ok_or_else(|| SyncError::Invariant(format!("document {doc} is not open")))
    }

    pub fn get_mut(&mut self, doc: &DocId) -> Result<&mut Document> {
        self.docs
            .get_mut(doc)
            .ok_or_else(|| SyncError::Invariant(format!("document {doc} is not open")))
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocId> {
        self.docs.keys()
    }
}
