//! Error taxonomy for the sync core.
//!
//! Every fallible public operation returns [`SyncError`]. The variants map
//! onto the recovery policy of the layer that raised them:
//!
//! | Variant | Raised by | Recovery |
//! |---------|-----------|----------|
//! | `Connectivity` | join / reconnect | retried with backoff, never fatal to the document |
//! | `ConflictResolution` | malformed operations | logged, operation dropped |
//! | `Persistence` | snapshot load / save | reported, local edits untouched |
//! | `Protocol` | frame encode / decode | frame dropped |

use std::time::Duration;

use crate::persistence::StoreError;
use crate::protocol::ProtocolError;

/// Failures to reach or stay attached to a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectivityError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Timed out after {0:?} waiting for room state")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Room '{0}' is full")]
    RoomFull(String),

    #[error("Transport offline")]
    Offline,
}

/// Top-level error returned by the sync core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Whether the session layer should keep retrying after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connectivity(_) | SyncError::Persistence(_))
    }
}
