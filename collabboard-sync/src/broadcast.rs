//! Per-room frame fan-out with bounded receiver lag.
//!
//! One tokio broadcast channel per room; a send costs the same for 1 or 100 peers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames. Every frame is tagged with its origin connection so a peer's
//! own messages are not echoed back to it.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::UserInfo;
use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame plus the connection it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `Uuid::nil()` for frames originated by the room itself.
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether the receiving connection should forward this frame.
    pub fn is_for(&self, connection_id: &Uuid) -> bool {
        self.origin != *connection_id
    }
}

/// Point-in-time counters for one room's fan-out.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
#[derive(Default)]
struct FanoutCounters {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    /// Connected peers, keyed by connection id
    peers: Arc<RwLock<HashMap<Uuid, UserInfo>>>,
    capacity: usize,
    counters: Arc<FanoutCounters>,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow peer may fall behind before it
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            counters: Arc::new(FanoutCounters::default()),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, connection_id: Uuid, user: UserInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(connection_id, user);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<UserInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode once and fan out to every peer except `origin`.
    ///
    /// Returns the number of receivers the frame reached (the origin's own
    /// receiver included; filtering happens on the receiving side).
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Envelope { origin, frame }))
    }

    /// Fan out an already-encoded frame.
    pub fn broadcast_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.counters
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<(Uuid, UserInfo)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, user)| (*id, user.clone()))
            .collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
