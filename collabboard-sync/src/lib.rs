//! # collabboard-sync: Replication core for a collaborative whiteboard
//!
//! Keeps every replica of a shared whiteboard document converging without
//! locks: edits are applied locally at once, exchanged through a per-document
//! room, and merged with field-level last-writer-wins registers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    Transport     ┌──────────────┐
//! │ SyncSession  │ ◄──────────────► │ RoomHub      │
//! │ (per replica)│   SyncMessage    │ (per process)│
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ Document     │                  │ Room         │──► BroadcastGroup
//! │ PresenceLayer│                  │ Document     │──► PersistenceBridge
//! └──────────────┘                  └──────────────┘        │
//!                                                           ▼
//!                                                   SnapshotStore
//!                                              (MemoryStore / RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: Replica ids, Lamport clock, LWW stamps
//! - [`record`]: Per-record register state and the merge rule
//! - [`operation`]: `put` / `patch` / `remove` operations
//! - [`document`]: Replicated document with change feed
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room fan-out with backpressure
//! - [`room`]: Authoritative room replicas and the per-peer protocol
//! - [`transport`]: WebSocket and in-process transports
//! - [`server`]: WebSocket sync server
//! - [`session`]: Client session with outbox and reconnect
//! - [`presence`]: Cursors, identities and the roster
//! - [`persistence`]: Snapshots and the async persistence bridge
//! - [`storage`]: RocksDB snapshot store

pub mod broadcast;
pub mod clock;
pub mod document;
pub mod error;
pub mod operation;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod record;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use clock::{LamportClock, OpId, ReplicaId, Stamp};
pub use document::{ChangeOrigin, Document, DocumentChange, DocumentState};
pub use error::{ConnectivityError, SyncError};
pub use operation::{Mutation, Operation};
pub use persistence::{
    MemoryStore, PersistenceBridge, Snapshot, SnapshotMetadata, SnapshotStore, StoreError,
};
pub use presence::{Cursor, PresenceLayer, PresenceRecord, Roster, RosterSummary, UserInfo};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use record::{Fields, Record, RecordChange, RecordId, RecordState};
pub use room::{HubStats, Room, RoomConfig, RoomHub};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Backoff, ConnectionState, Outbox, SessionConfig, SessionEvent, SyncSession};
pub use storage::{DocumentStore, StoreConfig};
pub use transport::{Connection, LocalTransport, Transport, WsTransport};
