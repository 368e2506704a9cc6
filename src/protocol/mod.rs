//! The replication vocabulary and state machines: wire message enums, the
//! per-document subscription lifecycle, and the ephemeral awareness
//! protocol. Everything here is transport-agnostic; frames are produced and
//! consumed as bytes by the engine through its ports.

pub mod awareness;
pub mod message;
pub mod session;

pub use awareness::{Awareness, AwarenessEntry, AwarenessUpdate};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use session::{Session, SyncStatus};
