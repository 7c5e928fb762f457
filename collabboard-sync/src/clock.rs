//! Replica identity and logical time.
//!
//! Concurrent writes are ordered by [`Stamp`], compared lexicographically as
//! `(version, timestamp, replica)`. The replica id is the last component, so
//! two replicas resolving the same conflict always pick the same winner
//! without talking to each other.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one replica of a document.
///
/// Ordered lexicographically; the order is the final LWW tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random replica id (UUID v4 text).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lamport clock: advances on every local event and jumps forward past any
/// remote timestamp it observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Merge a remote timestamp.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }

    pub fn now(&self) -> u64 {
        self.time
    }
}

/// Unique operation id: originating replica plus its local sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    /// Replica-local sequence, starting at 1.
    pub seq: u64,
}

/// LWW comparison key attached to every register write.
///
/// Field order matters: the derived `Ord` compares `version`, then
/// `timestamp`, then `replica`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub version: u64,
    pub timestamp: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(version: u64, timestamp: u64, replica: impl Into<ReplicaId>) -> Self {
        Self {
            version,
            timestamp,
            replica: replica.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamport_tick_and_observe() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);

        clock.observe(10);
        assert_eq!(clock.now(), 10);
        assert_eq!(clock.tick(), 11);

        // Observing the past never rewinds.
        clock.observe(3);
        assert_eq!(clock.now(), 11);
    }

    #[test]
    fn test_stamp_order_is_lexicographic() {
        let low_version = Stamp::new(1, 99, "z");
        let high_version = Stamp::new(2, 1, "a");
        assert!(high_version > low_version);

        let early = Stamp::new(3, 4, "z");
        let late = Stamp::new(3, 5, "a");
        assert!(late > early);

        let a = Stamp::new(3, 5, "A");
        let b = Stamp::new(3, 5, "B");
        assert!(b > a);
    }

    #[test]
    fn test_random_replica_ids_differ() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_replica_id_serializes_as_plain_string() {
        let id = ReplicaId::new("replica-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"replica-7\"");
    }
}
