//! Field-level last-writer-wins document.
//!
//! Each field is an independent register carrying the hybrid timestamp of its
//! last write. Deletion installs a tombstone (`value: None`) that is kept
//! forever; dropping tombstones would need cross-replica garbage-collection
//! consensus this core does not perform.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clocks::hybrid::HybridTimestamp;

/// One register: the value (`None` = tombstone) and the write that produced
/// it. The winning write for a field is the maximal `(wall_ms, client)`
/// stamp, so convergence never depends on delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub value: Option<Value>,
    pub stamp: HybridTimestamp,
}

/// The delta unit: a single field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldWrite {
    pub field: String,
    pub value: Option<Value>,
    pub stamp: HybridTimestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwMap {
    fields: FxHashMap<String, Field>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a field locally. The caller issues the stamp (one `tick` per
    /// mutation); batch assignments share a stamp via [`LwwMap::set_many`].
    pub fn set(&mut self, field: &str, value: Value, stamp: HybridTimestamp) -> FieldWrite {
        let write = FieldWrite {
            field: field.to_string(),
            value: Some(value),
            stamp,
        };
        self.apply(&write);
        write
    }

    /// Assign several fields under one shared stamp. Each field is still
    /// merged independently on remote replicas.
    pub fn set_many(
        &mut self,
        entries: Vec<(String, Value)>,
        stamp: HybridTimestamp,
    ) -> Vec<FieldWrite> {
        entries
            .into_iter()
            .map(|(field, value)| {
                let write = FieldWrite {
                    field,
                    value: Some(value),
                    stamp,
                };
                self.apply(&write);
                write
            })
            .collect()
    }

    /// Delete a field: a tombstone write, semantics identical to `set`.
    pub fn delete(&mut self, field: &str, stamp: HybridTimestamp) -> FieldWrite {
        let write = FieldWrite {
            field: field.to_string(),
            value: None,
            stamp,
        };
        self.apply(&write);
        write
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|f| f.value.as_ref())
    }

    pub fn field(&self, field: &str) -> Option<&Field> {
        self.fields.get(field)
    }

    /// Visible (non-tombstoned) entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .filter_map(|(name, f)| f.value.as_ref().map(|v| (name.as_str(), v)))
    }

    /// Full state as writes, tombstones included, for sync responses and
    /// state transfer.
    pub fn snapshot_writes(&self) -> Vec<FieldWrite> {
        self.fields
            .iter()
            .map(|(field, f)| FieldWrite {
                field: field.clone(),
                value: f.value.clone(),
                stamp: f.stamp,
            })
            .collect()
    }

    /// Merge one remote write. Installs iff the incoming stamp strictly
    /// dominates the register's; equal stamps are the same write (stamps
    /// embed the issuing client), so re-application is a no-op.
    pub fn apply(&mut self, write: &FieldWrite) -> bool {
        match self.fields.get(&write.field) {
            Some(existing) if write.stamp <= existing.stamp => false,
            _ => {
                self.fields.insert(
                    write.field.clone(),
                    Field {
                        value: write.value.clone(),
                        stamp: write.stamp,
                    },
                );
                true
            }
        }
    }
}
