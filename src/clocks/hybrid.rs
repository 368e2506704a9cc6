use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::clocks::client_id::ClientId;

/// A totally ordered timestamp: observed wall-clock milliseconds broken by
/// the replica id. The derived `Ord` is the lexicographic `(wall_ms, client)`
/// order every last-writer-wins decision in the crate relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    pub wall_ms: u64,
    pub client: ClientId,
}

impl Display for HybridTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.wall_ms, self.client)
    }
}

/// Issues per-replica timestamps that are strictly increasing even when the
/// physical clock jumps backward. Backward jumps are absorbed, never
/// signaled.
#[derive(Debug, Clone)]
pub struct HybridClock {
    client: ClientId,
    last_wall_ms: u64,
}

impl HybridClock {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            last_wall_ms: 0,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Issue `(max(now_ms, last + 1), client)` and record it.
    pub fn issue(&mut self, now_ms: u64) -> HybridTimestamp {
        let wall_ms = now_ms.max(self.last_wall_ms + 1);
        self.last_wall_ms = wall_ms;
        HybridTimestamp {
            wall_ms,
            client: self.client,
        }
    }
}
