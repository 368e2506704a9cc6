//! Peritext-style formatting overlay on the Fugue sequence.
//!
//! Spans anchor to item identities, not positions, so they survive
//! concurrent edits. The anchor side decides boundary behaviour: an
//! expanding end binds to the character *following* the range (text typed in
//! the gap inherits the attribute), a contracting end binds to the last
//! covered character (typed text stays outside). Start anchors bind to the
//! first covered character for every attribute, which keeps text typed
//! before a span unformatted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::clocks::client_id::ClientId;
use crate::clocks::hybrid::HybridTimestamp;
use crate::crdt::fugue::{FugueText, TextOp};
use crate::crdt::OpId;

use rustc_hash::FxHashMap;

/// Which side of its gap an anchor gravitates to under concurrent
/// insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bias {
    Before,
    After,
}

/// A span boundary bound to an item identity. `item: None` is the document
/// edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub item: Option<OpId>,
    pub bias: Bias,
}

/// A range attribute: grow-only up to the tombstone lattice. Conflicts per
/// character per attribute resolve to the greatest stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSpan {
    pub id: OpId,
    pub start: Anchor,
    pub end: Anchor,
    pub attr: String,
    pub value: Value,
    pub stamp: HybridTimestamp,
    pub tombstone: bool,
}

/// The delta unit for rich text: either a sequence edit or a span. The tag
/// must not collide with the inner text op's own tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "camelCase")]
pub enum RichTextOp {
    Text(TextOp),
    Format(FormatSpan),
}

/// Attribute policy: whether an insertion at the end boundary inherits the
/// attribute. Inline emphasis spreads; identity-like ranges do not.
pub fn attr_expands(attr: &str) -> bool {
    !matches!(attr, "link" | "comment" | "mention")
}

pub type AttrMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichText {
    text: FugueText,
    spans: Vec<FormatSpan>,
}

impl RichText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.text.text()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn insert(
        &mut self,
        index: usize,
        content: &str,
        client: ClientId,
        start_seq: u64,
    ) -> Vec<RichTextOp> {
        self.text
            .insert(index, content, client, start_seq)
            .into_iter()
            .map(RichTextOp::Text)
            .collect()
    }

    pub fn delete(&mut self, index: usize, len: usize) -> Vec<RichTextOp> {
        self.text
            .delete(index, len)
            .into_iter()
            .map(RichTextOp::Text)
            .collect()
    }

    /// Apply `attr = value` over the visible range `[start, end)`. Anchors
    /// bind to the item identities at those positions with boundary kinds
    /// chosen by the attribute policy.
    pub fn format(
        &mut self,
        start: usize,
        end: usize,
        attr: &str,
        value: Value,
        id: OpId,
        stamp: HybridTimestamp,
    ) -> Vec<RichTextOp> {
        self.make_span(start, end, attr, value, id, stamp, false)
    }

    /// Remove `attr` over the range: a span tombstone under the same
    /// anchoring rules.
    pub fn unformat(
        &mut self,
        start: usize,
        end: usize,
        attr: &str,
        id: OpId,
        stamp: HybridTimestamp,
    ) -> Vec<RichTextOp> {
        self.make_span(start, end, attr, Value::Null, id, stamp, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn make_span(
        &mut self,
        start: usize,
        end: usize,
        attr: &str,
        value: Value,
        id: OpId,
        stamp: HybridTimestamp,
        tombstone: bool,
    ) -> Vec<RichTextOp> {
        if start >= end || start >= self.text.len() {
            return Vec::new();
        }
        let start_anchor = Anchor {
            item: self.text.id_at(start),
            bias: Bias::Before,
        };
        let end_anchor = if attr_expands(attr) {
            // Bind to the following character (or the document edge) so the
            // boundary floats right as text is typed into the gap.
            Anchor {
                item: self.text.id_at(end),
                bias: Bias::After,
            }
        } else {
            Anchor {
                item: self.text.id_at(end - 1),
                bias: Bias::Before,
            }
        };
        let span = FormatSpan {
            id,
            start: start_anchor,
            end: end_anchor,
            attr: attr.to_string(),
            value,
            stamp,
            tombstone,
        };
        self.insert_span(span.clone());
        vec![RichTextOp::Format(span)]
    }

    /// Full state as ops, for sync responses and state transfer.
    pub fn snapshot_ops(&self) -> Vec<RichTextOp> {
        let mut ops: Vec<RichTextOp> = self
            .text
            .snapshot_ops()
            .into_iter()
            .map(RichTextOp::Text)
            .collect();
        ops.extend(self.spans.iter().cloned().map(RichTextOp::Format));
        ops
    }

    /// Absorb a remote op. Span installation is idempotent on span id; text
    /// ops follow the Fugue rules, including origin buffering.
    pub fn apply(&mut self, op: RichTextOp) -> Result<bool, String> {
        match op {
            RichTextOp::Text(text_op) => self.text.apply(text_op),
            RichTextOp::Format(span) => Ok(self.insert_span(span)),
        }
    }

    /// Linearize: walk the sequence, compute the active attribute set per
    /// character, emit a new run whenever it changes.
    pub fn runs(&self) -> Vec<(String, AttrMap)> {
        let items = self.text.items();
        let resolved = self.resolved_spans();

        let mut runs: Vec<(String, AttrMap)> = Vec::new();
        for (seq_idx, item) in items.iter().enumerate() {
            if item.deleted {
                continue;
            }
            let attrs = self.attrs_at(seq_idx, &resolved);
            match runs.last_mut() {
                Some((text, last)) if *last == attrs => text.push(item.ch),
                _ => runs.push((item.ch.to_string(), attrs)),
            }
        }
        runs
    }

    /// Active attributes of the visible character at `index`.
    pub fn attrs_at_index(&self, index: usize) -> AttrMap {
        let Some(id) = self.text.id_at(index) else {
            return AttrMap::new();
        };
        let Some(seq_idx) = self.text.position(&id) else {
            return AttrMap::new();
        };
        self.attrs_at(seq_idx, &self.resolved_spans())
    }

    /// Keep spans ordered by id so replicas hold byte-identical state
    /// regardless of arrival order. Returns false for a duplicate.
    fn insert_span(&mut self, span: FormatSpan) -> bool {
        match self.spans.binary_search_by(|s| s.id.cmp(&span.id)) {
            Ok(_) => false,
            Err(pos) => {
                self.spans.insert(pos, span);
                true
            }
        }
    }

    /// Spans with both anchors resolvable against the current item set, as
    /// `[start, end)` sequence-index ranges. Spans whose anchors have not
    /// arrived yet are simply invisible until the text catches up.
    fn resolved_spans(&self) -> SmallVec<[(usize, usize, &FormatSpan); 8]> {
        self.spans
            .iter()
            .filter_map(|span| {
                let start = self.resolve_start(&span.start)?;
                let end = self.resolve_end(&span.end)?;
                Some((start, end, span))
            })
            .collect()
    }

    fn attrs_at(&self, seq_idx: usize, resolved: &[(usize, usize, &FormatSpan)]) -> AttrMap {
        // Per attribute key, the covering span with the greatest stamp wins;
        // a winning tombstone means the attribute is absent.
        let mut winners: FxHashMap<&str, &FormatSpan> = FxHashMap::default();
        for (start, end, span) in resolved {
            if seq_idx < *start || seq_idx >= *end {
                continue;
            }
            match winners.get(span.attr.as_str()) {
                Some(current) if current.stamp >= span.stamp => {}
                _ => {
                    winners.insert(span.attr.as_str(), span);
                }
            }
        }
        winners
            .into_iter()
            .filter(|(_, span)| !span.tombstone)
            .map(|(attr, span)| (attr.to_string(), span.value.clone()))
            .collect()
    }

    fn resolve_start(&self, anchor: &Anchor) -> Option<usize> {
        match (anchor.item, anchor.bias) {
            (None, _) => Some(0),
            (Some(id), Bias::Before) => self.text.position(&id),
            (Some(id), Bias::After) => self.text.position(&id).map(|p| p + 1),
        }
    }

    fn resolve_end(&self, anchor: &Anchor) -> Option<usize> {
        match (anchor.item, anchor.bias) {
            // Document edge: the span keeps covering appended text.
            (None, _) => Some(self.text.items().len()),
            // Expanding end: everything strictly before the following
            // character, including items later inserted into the gap.
            (Some(id), Bias::After) => self.text.position(&id),
            // Contracting end: through the anchored character only.
            (Some(id), Bias::Before) => self.text.position(&id).map(|p| p + 1),
        }
    }
}
