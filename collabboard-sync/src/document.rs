//! Replicated document: record map, Lamport clock and change feed.
//!
//! ```text
//! local edit ──► local_mutate() ──► Operation ──► (session outbox)
//!                      │
//!                      ▼
//!                  apply_op ──► RecordState register writes
//!                      │
//!                      ▼
//!             DocumentChange ──► subscribers (UI, persistence dirty flag)
//!
//! remote op  ──► apply()        ─┐
//! room state ──► merge_state()  ─┴─► same register writes, same feed
//! ```
//!
//! Nothing here blocks or touches the network; a document is owned by one
//! task and mutated only from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::clock::{LamportClock, OpId, ReplicaId};
use crate::error::SyncError;
use crate::operation::{Mutation, Operation};
use crate::record::{Record, RecordChange, RecordId, RecordState, Register};

/// Capacity of the change feed before slow subscribers start lagging.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Complete replicated state: everything a replica needs to converge.
///
/// Canonical: two replicas that applied the same set of operations hold
/// equal `DocumentState`s, whatever the delivery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub records: BTreeMap<RecordId, RecordState>,
}

impl DocumentState {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Largest Lamport timestamp anywhere in the state.
    pub fn max_timestamp(&self) -> u64 {
        self.records
            .values()
            .map(RecordState::max_timestamp)
            .max()
            .unwrap_or(0)
    }

    /// Live records only.
    pub fn live_records(&self) -> Vec<Record> {
        self.records
            .iter()
            .filter_map(|(id, state)| state.materialize(id))
            .collect()
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification fired after every apply that altered visible state.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
    pub changes: Vec<RecordChange>,
}

/// One replica of a shared document.
pub struct Document {
    replica: ReplicaId,
    clock: LamportClock,
    next_seq: u64,
    state: DocumentState,
    changes: broadcast::Sender<DocumentChange>,
}

impl Document {
    /// Empty document owned by `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        Self::from_state(replica, DocumentState::default())
    }

    /// Seed a replica from a stored or received state.
    ///
    /// Sequence numbers resume past the seeded clock. A local operation's
    /// seq never exceeds its timestamp, so a replica id reused across
    /// sessions cannot repeat an `OpId` that the seeding state has seen.
    pub fn from_state(replica: ReplicaId, state: DocumentState) -> Self {
        let mut clock = LamportClock::new();
        clock.observe(state.max_timestamp());
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            replica,
            next_seq: clock.now() + 1,
            clock,
            state,
            changes,
        }
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    /// Live record by id.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.state.records.get(id).and_then(|s| s.materialize(id))
    }

    /// All live records, ordered by id.
    pub fn records(&self) -> Vec<Record> {
        self.state.live_records()
    }

    pub fn len(&self) -> usize {
        self.state.records.values().filter(|s| s.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the full replicated state.
    pub fn state(&self) -> DocumentState {
        self.state.clone()
    }

    pub fn state_ref(&self) -> &DocumentState {
        &self.state
    }

    /// Subscribe to the change feed. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Timestamp, apply and return a local mutation for broadcast.
    pub fn local_mutate(&mut self, mutation: Mutation) -> Result<Operation, SyncError> {
        let version = self
            .state
            .records
            .get(mutation.record_id())
            .map_or(0, |s| s.version)
            + 1;
        let op = Operation {
            id: OpId {
                replica: self.replica.clone(),
                seq: self.next_seq,
            },
            version,
            timestamp: self.clock.tick(),
            mutation,
        };
        op.validate()?;
        self.next_seq += 1;

        let changes = self.apply_op(&op);
        self.notify(ChangeOrigin::Local, changes);
        Ok(op)
    }

    /// Apply an operation from any replica. Idempotent.
    ///
    /// Returns the visible changes; an empty list means the operation was
    /// already known or is dominated by newer writes.
    pub fn apply(&mut self, op: &Operation) -> Result<Vec<RecordChange>, SyncError> {
        op.validate()?;
        self.clock.observe(op.timestamp);
        let changes = self.apply_op(op);
        let origin = if op.id.replica == self.replica {
            ChangeOrigin::Local
        } else {
            ChangeOrigin::Remote
        };
        self.notify(origin, changes.clone());
        Ok(changes)
    }

    /// Join another replica's full state into this one.
    pub fn merge_state(&mut self, other: &DocumentState) -> Vec<RecordChange> {
        self.clock.observe(other.max_timestamp());
        let mut changes = Vec::new();
        for (id, incoming) in &other.records {
            let entry = self.state.records.entry(id.clone()).or_default();
            let before = entry.materialize(id);
            if entry.merge(incoming) {
                if let Some(change) = RecordChange::between(id, before, entry.materialize(id)) {
                    changes.push(change);
                }
            }
        }
        self.notify(ChangeOrigin::Remote, changes.clone());
        changes
    }

    fn apply_op(&mut self, op: &Operation) -> Vec<RecordChange> {
        let stamp = op.stamp();
        let id = op.record_id().to_string();
        let entry = self.state.records.entry(id.clone()).or_default();
        let before = entry.materialize(&id);

        let mut changed = entry.observe_version(op.version);
        match &op.mutation {
            Mutation::Put {
                kind,
                fields,
                parent_id,
                ..
            } => {
                changed |= entry.put(kind, &stamp);
                changed |= entry.write_parent(Register::new(parent_id.clone(), stamp.clone()));
                for (name, value) in fields {
                    changed |= entry.write_field(name, Register::new(value.clone(), stamp.clone()));
                }
            }
            Mutation::Patch {
                fields, parent_id, ..
            } => {
                if let Some(parent) = parent_id {
                    changed |= entry.write_parent(Register::new(parent.clone(), stamp.clone()));
                }
                for (name, value) in fields {
                    changed |= entry.write_field(name, Register::new(value.clone(), stamp.clone()));
                }
            }
            Mutation::Remove { .. } => {
                changed |= entry.remove(&stamp);
            }
        }

        if !changed {
            log::trace!("Operation {}:{} had no effect", op.id.replica, op.id.seq);
            return Vec::new();
        }
        RecordChange::between(&id, before, entry.materialize(&id))
            .into_iter()
            .collect()
    }

    fn notify(&self, origin: ChangeOrigin, changes: Vec<RecordChange>) {
        if changes.is_empty() {
            return;
        }
        // No subscribers is fine.
        let _ = self.changes.send(DocumentChange { origin, changes });
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("replica", &self.replica)
            .field("clock", &self.clock.now())
            .field("records", &self.state.records.len())
            .finish()
    }
}
