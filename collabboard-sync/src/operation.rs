//! Immutable descriptions of single document changes.

use serde::{Deserialize, Deserializer, Serialize};

use crate::clock::{OpId, Stamp};
use crate::error::SyncError;
use crate::record::{Fields, RecordId};

/// The change carried by an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Replace the record's content.
    Put {
        id: RecordId,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        fields: Fields,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<RecordId>,
    },
    /// Write individual fields. Creates the record if it is unknown.
    Patch {
        id: RecordId,
        #[serde(default)]
        fields: Fields,
        /// `Some(None)` detaches from the parent, `None` leaves it alone.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "explicit_null"
        )]
        parent_id: Option<Option<RecordId>>,
    },
    /// Tombstone the record.
    Remove { id: RecordId },
}

impl Mutation {
    pub fn put(id: impl Into<RecordId>, kind: impl Into<String>, fields: Fields) -> Self {
        Mutation::Put {
            id: id.into(),
            kind: kind.into(),
            fields,
            parent_id: None,
        }
    }

    pub fn patch(id: impl Into<RecordId>, fields: Fields) -> Self {
        Mutation::Patch {
            id: id.into(),
            fields,
            parent_id: None,
        }
    }

    pub fn remove(id: impl Into<RecordId>) -> Self {
        Mutation::Remove { id: id.into() }
    }

    /// Move a record under `parent` (or to the top level with `None`).
    pub fn reparent(id: impl Into<RecordId>, parent: Option<RecordId>) -> Self {
        Mutation::Patch {
            id: id.into(),
            fields: Fields::new(),
            parent_id: Some(parent),
        }
    }

    /// Attach a parent pointer to a `put` or `patch`. No effect on `remove`.
    pub fn with_parent(mut self, parent: impl Into<RecordId>) -> Self {
        match &mut self {
            Mutation::Put { parent_id, .. } => *parent_id = Some(parent.into()),
            Mutation::Patch { parent_id, .. } => *parent_id = Some(Some(parent.into())),
            Mutation::Remove { .. } => {}
        }
        self
    }

    pub fn record_id(&self) -> &str {
        match self {
            Mutation::Put { id, .. } | Mutation::Patch { id, .. } | Mutation::Remove { id } => id,
        }
    }
}

/// A timestamped mutation, created once at its originating replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    /// Per-record version this write claims.
    pub version: u64,
    /// Lamport time at the originating replica.
    pub timestamp: u64,
    pub mutation: Mutation,
}

impl Operation {
    /// The LWW key every register written by this operation carries.
    pub fn stamp(&self) -> Stamp {
        Stamp {
            version: self.version,
            timestamp: self.timestamp,
            replica: self.id.replica.clone(),
        }
    }

    pub fn record_id(&self) -> &str {
        self.mutation.record_id()
    }

    /// Reject operations missing any component of their clock.
    ///
    /// Well-formed replicas never produce these; a failure here means a
    /// buggy or hostile peer, and the caller drops the operation.
    pub fn validate(&self) -> Result<(), SyncError> {
        let problem = if self.id.replica.is_empty() {
            Some("empty replica id")
        } else if self.id.seq == 0 {
            Some("zero sequence number")
        } else if self.version == 0 {
            Some("zero version")
        } else if self.timestamp == 0 {
            Some("zero timestamp")
        } else if self.record_id().is_empty() {
            Some("empty record id")
        } else {
            None
        };

        match problem {
            Some(reason) => Err(SyncError::ConflictResolution(format!(
                "malformed operation {}:{}: {reason}",
                self.id.replica, self.id.seq
            ))),
            None => Ok(()),
        }
    }
}

/// Distinguish a missing key (`None`) from an explicit `null` (`Some(None)`).
fn explicit_null<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
