//! Records and their replicated per-field state.
//!
//! A [`RecordState`] is the CRDT behind one record id. It holds one
//! last-writer-wins register per field, one for `parent_id`, one for the
//! type tag, and a tombstone stamp:
//!
//! ```text
//!             put(kind, fields) @ S
//!                    │
//!     ┌──────────────┼─────────────────────┐
//!     ▼              ▼                     ▼
//!  kind reg      base = S           field regs ≥ S kept,
//!  (max put)    (put stamp)         older ones pruned
//!
//!             remove @ T
//!                    │
//!                    ▼
//!  tombstone = max(tombstone, T); every content register ≤ T pruned
//! ```
//!
//! A register is visible iff its stamp is strictly above the tombstone and
//! not below the latest put. Invisible registers are never stored, so two
//! replicas that saw the same writes hold identical `RecordState`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::clock::{ReplicaId, Stamp};

/// Opaque record identifier, unique within a document.
pub type RecordId = String;

/// Schema-opaque field map. The sync core only looks at field names.
pub type Fields = BTreeMap<String, Value>;

/// A value together with the stamp of the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T> Register<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }
}

/// Replicated state of one record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    /// Type tag of the most recent `put`; its stamp is the put base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Register<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Register<Option<RecordId>>>,
    #[serde(default)]
    pub fields: BTreeMap<String, Register<Value>>,
    /// Highest operation version ever applied to this record.
    pub version: u64,
}

impl RecordState {
    /// Stamp of the latest `put`, if any.
    pub fn base(&self) -> Option<&Stamp> {
        self.kind.as_ref().map(|k| &k.stamp)
    }

    /// Whether a write at `stamp` survives the tombstone and the latest put.
    pub fn admits(&self, stamp: &Stamp) -> bool {
        let above_tombstone = self.tombstone.as_ref().is_none_or(|t| stamp > t);
        let not_below_base = self.base().is_none_or(|b| stamp >= b);
        above_tombstone && not_below_base
    }

    /// Whether the record currently exists from the reader's point of view.
    pub fn is_live(&self) -> bool {
        let put_live = match (self.base(), &self.tombstone) {
            (Some(base), Some(tomb)) => base > tomb,
            (Some(_), None) => true,
            (None, _) => false,
        };
        put_live || self.parent.is_some() || !self.fields.is_empty()
    }

    /// Record a `put`: raises the base and prunes content written before it.
    ///
    /// The type tag is kept even when the put is already tombstoned, so a
    /// resurrected record still reports its last known type.
    pub fn put(&mut self, kind: &str, stamp: &Stamp) -> bool {
        if self.base().is_some_and(|b| b >= stamp) {
            return false;
        }
        self.kind = Some(Register::new(kind.to_string(), stamp.clone()));
        self.prune();
        true
    }

    /// Record a `remove`: raises the tombstone and prunes dominated content.
    pub fn remove(&mut self, stamp: &Stamp) -> bool {
        if self.tombstone.as_ref().is_some_and(|t| t >= stamp) {
            return false;
        }
        self.tombstone = Some(stamp.clone());
        self.prune();
        true
    }

    /// LWW write of one field. Returns whether the stored state changed.
    pub fn write_field(&mut self, name: &str, register: Register<Value>) -> bool {
        if !self.admits(&register.stamp) {
            return false;
        }
        match self.fields.get(name) {
            Some(current) if current.stamp >= register.stamp => false,
            _ => {
                self.fields.insert(name.to_string(), register);
                true
            }
        }
    }

    /// LWW write of the parent pointer.
    pub fn write_parent(&mut self, register: Register<Option<RecordId>>) -> bool {
        if !self.admits(&register.stamp) {
            return false;
        }
        match &self.parent {
            Some(current) if current.stamp >= register.stamp => false,
            _ => {
                self.parent = Some(register);
                true
            }
        }
    }

    pub fn observe_version(&mut self, version: u64) -> bool {
        if version > self.version {
            self.version = version;
            true
        } else {
            false
        }
    }

    /// Join another replica's state for the same record id.
    ///
    /// Register-wise maximum followed by pruning, which makes the merge
    /// commutative, associative and idempotent.
    pub fn merge(&mut self, other: &RecordState) -> bool {
        let mut changed = false;
        if let Some(kind) = &other.kind {
            changed |= self.put(&kind.value, &kind.stamp);
        }
        if let Some(tomb) = &other.tombstone {
            changed |= self.remove(tomb);
        }
        if let Some(parent) = &other.parent {
            changed |= self.write_parent(parent.clone());
        }
        for (name, register) in &other.fields {
            changed |= self.write_field(name, register.clone());
        }
        changed |= self.observe_version(other.version);
        changed
    }

    /// Largest logical timestamp referenced by this state.
    pub fn max_timestamp(&self) -> u64 {
        let stamps = self
            .kind
            .iter()
            .map(|k| &k.stamp)
            .chain(self.tombstone.iter())
            .chain(self.parent.iter().map(|p| &p.stamp))
            .chain(self.fields.values().map(|f| &f.stamp));
        stamps.map(|s| s.timestamp).max().unwrap_or(0)
    }

    /// Reader view of this record, `None` when absent or tombstoned.
    pub fn materialize(&self, id: &str) -> Option<Record> {
        if !self.is_live() {
            return None;
        }

        let base = self
            .base()
            .filter(|b| self.tombstone.as_ref().is_none_or(|t| *b > t));
        let last_writer = base
            .into_iter()
            .chain(self.parent.iter().map(|p| &p.stamp))
            .chain(self.fields.values().map(|f| &f.stamp))
            .max()
            .map(|s| s.replica.clone())
            .unwrap_or_else(|| ReplicaId::new(""));

        Some(Record {
            id: id.to_string(),
            kind: self.kind.as_ref().map(|k| k.value.clone()).unwrap_or_default(),
            fields: self
                .fields
                .iter()
                .map(|(name, reg)| (name.clone(), reg.value.clone()))
                .collect(),
            parent_id: self.parent.as_ref().and_then(|p| p.value.clone()),
            last_writer,
            version: self.version,
        })
    }

    fn prune(&mut self) {
        let tombstone = self.tombstone.clone();
        let base = self.base().cloned();
        let keep = |stamp: &Stamp| {
            tombstone.as_ref().is_none_or(|t| stamp > t) && base.as_ref().is_none_or(|b| stamp >= b)
        };
        self.fields.retain(|_, reg| keep(&reg.stamp));
        if self.parent.as_ref().is_some_and(|p| !keep(&p.stamp)) {
            self.parent = None;
        }
    }
}

/// Materialized view of a live record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Schema tag. Empty for records that only ever received patches.
    #[serde(rename = "type")]
    pub kind: String,
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
    pub last_writer: ReplicaId,
    pub version: u64,
}

/// Visible effect of an apply or merge on a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Created(Record),
    Updated(Record),
    Removed(RecordId),
}

impl RecordChange {
    /// Compare two materialized views of the same record.
    pub fn between(id: &str, before: Option<Record>, after: Option<Record>) -> Option<Self> {
        match (before, after) {
            (None, Some(rec)) => Some(RecordChange::Created(rec)),
            (Some(_), None) => Some(RecordChange::Removed(id.to_string())),
            (Some(old), Some(new)) if old != new => Some(RecordChange::Updated(new)),
            _ => None,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            RecordChange::Created(rec) | RecordChange::Updated(rec) => &rec.id,
            RecordChange::Removed(id) => id,
        }
    }
}
