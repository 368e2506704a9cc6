use thiserror::Error;

use crate::crdt::OpId;
use crate::DocId;

/// Error taxonomy of the core.
///
/// `Transport` and `Protocol` are handled internally (reconnect, resync) and
/// only counted; the remaining classes surface to the application. No error
/// aborts the replica.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection drop or send timeout. The reconnect engine takes over.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed delta, unknown message kind, or unresolvable origins past
    /// the buffer horizon. Answered with a full resync of the document.
    #[error("protocol error on document {doc}: {reason}")]
    Protocol { doc: DocId, reason: String },

    /// The server rejected a subscribe or a delta. The offending op is moved
    /// to the rejected list and never retried.
    #[error("rejected by server: {reason}")]
    Unauthorized { op: Option<OpId>, reason: String },

    /// A storage port failure that persisted across retries. The affected
    /// document enters a degraded read-only state.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Internal invariant violation, e.g. a vector clock regression. The
    /// document is re-initialized from storage or from a server sync.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The offline queue cap was reached. The local mutation is refused;
    /// already-queued ops continue to drain.
    #[error("offline queue full for document {doc}")]
    QueueFull { doc: DocId },
}

impl SyncError {
    /// Classes 1 and 2 of the taxonomy are absorbed silently (log + counter).
    pub fn is_silent(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Protocol { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Occurrence counters for the silently-handled error classes and other
/// events worth watching without surfacing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub transport_errors: u64,
    pub protocol_errors: u64,
    pub duplicate_deltas: u64,
    pub duplicate_acks: u64,
    pub storage_retries: u64,
    pub resyncs_requested: u64,
}
