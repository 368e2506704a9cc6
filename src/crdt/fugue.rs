//! Fugue sequence CRDT for plain text.
//!
//! Every character is an item carrying the identities of the neighbours the
//! author saw at insertion time. Order is derived from those origins: among
//! items sharing a left origin, the one whose right origin sits further left
//! comes later, and full-origin ties go to the greater item id. The rule is
//! total and replica-identical, which keeps two concurrently typed runs
//! contiguous instead of shuffled together.

use serde::{Deserialize, Serialize};

use crate::clocks::client_id::ClientId;
use crate::crdt::OpId;

/// Remote ops whose origins have not arrived yet buffer up to this many
/// entries; past the horizon the document asks for a full resync.
pub const ORIGIN_BUFFER_HORIZON: usize = 1024;

/// One character of the sequence. Ids are `(client, per-document logical
/// clock)` and globally unique; `deleted` is monotone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextItem {
    pub id: OpId,
    pub origin_left: Option<OpId>,
    pub origin_right: Option<OpId>,
    pub ch: char,
    pub deleted: bool,
}

/// The delta unit for text documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TextOp {
    Insert { item: TextItem },
    Delete { id: OpId },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FugueText {
    items: Vec<TextItem>,
    /// Ops waiting for their origins, retried after every integration.
    pending: Vec<TextOp>,
}

impl FugueText {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-order concatenation of the non-deleted items.
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|item| !item.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All items, tombstones included, in sequence order. The formatting
    /// overlay anchors to these.
    pub fn items(&self) -> &[TextItem] {
        &self.items
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence position of an item, tombstones included.
    pub fn position(&self, id: &OpId) -> Option<usize> {
        self.items.iter().position(|item| item.id == *id)
    }

    /// Id of the visible character at `index`.
    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .nth(index)
            .map(|item| item.id)
    }

    /// Insert `content` at the visible `index`. Item ids take consecutive
    /// logical clock values starting at `start_seq`; the caller has already
    /// ticked the document clock once per character.
    pub fn insert(
        &mut self,
        index: usize,
        content: &str,
        client: ClientId,
        start_seq: u64,
    ) -> Vec<TextOp> {
        let mut origin_left = if index == 0 { None } else { self.id_at(index - 1) };
        let origin_right = self.id_at(index);

        let mut ops = Vec::new();
        for (offset, ch) in content.chars().enumerate() {
            let item = TextItem {
                id: OpId::new(client, start_seq + offset as u64),
                origin_left,
                origin_right,
                ch,
                deleted: false,
            };
            origin_left = Some(item.id);
            self.integrate(item.clone());
            ops.push(TextOp::Insert { item });
        }
        ops
    }

    /// Mark `len` visible characters starting at `index` as deleted.
    pub fn delete(&mut self, index: usize, len: usize) -> Vec<TextOp> {
        let ids: Vec<OpId> = self
            .items
            .iter()
            .filter(|item| !item.deleted)
            .skip(index)
            .take(len)
            .map(|item| item.id)
            .collect();
        let mut ops = Vec::new();
        for id in ids {
            if let Some(pos) = self.position(&id) {
                self.items[pos].deleted = true;
            }
            ops.push(TextOp::Delete { id });
        }
        ops
    }

    /// Full state as ops, for sync responses and state transfer. Items come
    /// out in sequence order so origins always precede their dependents;
    /// deletions are re-stated explicitly for receivers that already hold
    /// the item live.
    pub fn snapshot_ops(&self) -> Vec<TextOp> {
        let mut ops: Vec<TextOp> = self
            .items
            .iter()
            .map(|item| TextOp::Insert { item: item.clone() })
            .collect();
        ops.extend(
            self.items
                .iter()
                .filter(|item| item.deleted)
                .map(|item| TextOp::Delete { id: item.id }),
        );
        ops
    }

    /// Absorb a remote op. Idempotent on item id; ops whose origins are
    /// unknown buffer until their predecessors arrive. Errors only when the
    /// buffer horizon overflows, which the session answers with a full
    /// resync.
    pub fn apply(&mut self, op: TextOp) -> Result<bool, String> {
        let changed = match self.try_apply(&op) {
            Applied::Changed => true,
            Applied::Unchanged => false,
            Applied::MissingOrigin => {
                if self.pending.len() >= ORIGIN_BUFFER_HORIZON {
                    return Err(format!(
                        "origin buffer overflowed past {ORIGIN_BUFFER_HORIZON} items"
                    ));
                }
                self.pending.push(op);
                return Ok(false);
            }
        };
        if changed {
            self.drain_pending();
        }
        Ok(changed)
    }

    fn drain_pending(&mut self) {
        // Each delivery can unblock earlier arrivals, so restart the scan
        // after every success (same shape as a causal-delivery queue).
        let mut i = 0;
        while i < self.pending.len() {
            match self.try_apply(&self.pending[i].clone()) {
                Applied::Changed | Applied::Unchanged => {
                    self.pending.remove(i);
                    i = 0;
                }
                Applied::MissingOrigin => i += 1,
            }
        }
    }

    fn try_apply(&mut self, op: &TextOp) -> Applied {
        match op {
            TextOp::Insert { item } => {
                if self.position(&item.id).is_some() {
                    return Applied::Unchanged;
                }
                let left_known = item
                    .origin_left
                    .as_ref()
                    .map_or(true, |id| self.position(id).is_some());
                let right_known = item
                    .origin_right
                    .as_ref()
                    .map_or(true, |id| self.position(id).is_some());
                if !left_known || !right_known {
                    return Applied::MissingOrigin;
                }
                self.integrate(item.clone());
                Applied::Changed
            }
            TextOp::Delete { id } => match self.position(id) {
                Some(pos) if self.items[pos].deleted => Applied::Unchanged,
                Some(pos) => {
                    self.items[pos].deleted = true;
                    Applied::Changed
                }
                None => Applied::MissingOrigin,
            },
        }
    }

    /// Place a new item between its origins. Siblings sharing the left
    /// origin are ordered right-origin-position first, then greater id, so
    /// concurrent runs stay contiguous.
    fn integrate(&mut self, new_item: TextItem) {
        let left_idx: isize = new_item
            .origin_left
            .as_ref()
            .and_then(|id| self.position(id))
            .map(|p| p as isize)
            .unwrap_or(-1);
        let right_idx: usize = new_item
            .origin_right
            .as_ref()
            .and_then(|id| self.position(id))
            .unwrap_or(self.items.len());

        let mut dest = (left_idx + 1) as usize;
        let mut scanning = false;
        let mut i = dest;
        loop {
            if !scanning {
                dest = i;
            }
            if i == self.items.len() || i == right_idx {
                break;
            }
            let other = &self.items[i];
            let other_left: isize = other
                .origin_left
                .as_ref()
                .and_then(|id| self.position(id))
                .map(|p| p as isize)
                .unwrap_or(-1);
            let other_right: usize = other
                .origin_right
                .as_ref()
                .and_then(|id| self.position(id))
                .unwrap_or(self.items.len());

            if other_left < left_idx
                || (other_left == left_idx
                    && other_right == right_idx
                    && new_item.id > other.id)
            {
                break;
            }
            if other_left == left_idx {
                scanning = other_right < right_idx;
            }
            i += 1;
        }
        self.items.insert(dest, new_item);
    }
}

enum Applied {
    Changed,
    Unchanged,
    MissingOrigin,
}
