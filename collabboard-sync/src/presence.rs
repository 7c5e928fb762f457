//! Presence: ephemeral per-connection identity and cursor state.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceLayer::set_cursor()
//!       │  (coalesced: one send per 40ms window, trailing edge kept)
//!       ▼
//! SyncMessage::Presence { PresenceRecord }
//!       │
//!       ▼   (room fan-out, never merged into the document)
//! Remote PresenceLayer::apply_remote()
//!       │
//!       ▼
//! Roster (full list, re-published on every change)
//! ```
//!
//! Presence never reaches the CRDT engine or storage. A peer's entry is
//! dropped as soon as the room reports it gone, and the whole roster is
//! cleared when the local connection drops.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Collaborator colours, assigned by hashing the user id.
pub const PALETTE: [&str; 7] = [
    "#E57373", "#81C784", "#64B5F6", "#FFD54F", "#BA68C8", "#4DB6AC", "#FF8A65",
];

/// Default coalescing window for outgoing presence.
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(40);

/// Stable palette colour for a user id (FNV-1a).
pub fn palette_color(user_id: &str) -> &'static str {
    let hash = user_id.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// Identity seed handed over by the auth collaborator at join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub metadata: Value,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = palette_color(&user_id).to_string();
        Self {
            user_id,
            display_name: display_name.into(),
            color,
            metadata: Value::Null,
        }
    }

    /// Prefer the auth layer's colour when it supplies one.
    pub fn with_color_hint(mut self, hint: Option<&str>) -> Self {
        if let Some(color) = hint.filter(|c| !c.is_empty()) {
            self.color = color.to_string();
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Up to two uppercase initials for avatar badges ("Ada Lovelace" → "AL").
    pub fn initials(&self) -> String {
        let initials: String = self
            .display_name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .take(2)
            .flat_map(char::to_uppercase)
            .collect();
        if initials.is_empty() {
            "?".to_string()
        } else {
            initials
        }
    }
}

/// Cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One connection's presence. Exactly one writer: the owning connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub connection_id: Uuid,
    pub user: UserInfo,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

/// Remote collaborators in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    peers: Vec<PresenceRecord>,
}

/// Avatar-bar view: the first `limit` collaborators and how many are hidden.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterSummary {
    pub visible: Vec<PresenceRecord>,
    pub overflow: usize,
}

impl Roster {
    /// Insert or replace a peer's record. Returns whether anything changed.
    pub fn upsert(&mut self, record: PresenceRecord) -> bool {
        match self
            .peers
            .iter_mut()
            .find(|p| p.connection_id == record.connection_id)
        {
            Some(existing) if *existing == record => false,
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.peers.push(record);
                true
            }
        }
    }

    pub fn remove(&mut self, connection_id: &Uuid) -> Option<PresenceRecord> {
        let idx = self.peers.iter().position(|p| p.connection_id == *connection_id)?;
        Some(self.peers.remove(idx))
    }

    pub fn get(&self, connection_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.iter().find(|p| p.connection_id == *connection_id)
    }

    pub fn contains(&self, connection_id: &Uuid) -> bool {
        self.get(connection_id).is_some()
    }

    pub fn peers(&self) -> &[PresenceRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    pub fn summary(&self, limit: usize) -> RosterSummary {
        RosterSummary {
            visible: self.peers.iter().take(limit).cloned().collect(),
            overflow: self.peers.len().saturating_sub(limit),
        }
    }
}

/// Client-side presence state for one session.
///
/// Outgoing updates are coalesced: the first change in a quiet period goes
/// out immediately, later changes inside the same window collapse into one
/// trailing send at the end of the window.
#[derive(Debug)]
pub struct PresenceLayer {
    local: PresenceRecord,
    interval: Duration,
    last_sent: Option<Instant>,
    pending: bool,
    roster: Roster,
}

impl PresenceLayer {
    pub fn new(connection_id: Uuid, user: UserInfo, interval: Duration) -> Self {
        Self {
            local: PresenceRecord {
                connection_id,
                user,
                cursor: None,
            },
            interval,
            last_sent: None,
            pending: false,
            roster: Roster::default(),
        }
    }

    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn connection_id(&self) -> Uuid {
        self.local.connection_id
    }

    /// Update the local cursor. Returns the record to send now, if any.
    pub fn set_cursor(&mut self, cursor: Option<Cursor>, now: Instant) -> Option<PresenceRecord> {
        self.local.cursor = cursor;
        self.schedule(now)
    }

    /// Update the local identity (e.g. metadata). Same coalescing as cursors.
    pub fn set_user(&mut self, user: UserInfo, now: Instant) -> Option<PresenceRecord> {
        self.local.user = user;
        self.schedule(now)
    }

    /// Deadline of the pending trailing send.
    pub fn next_flush_at(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        Some(self.last_sent.map_or_else(Instant::now, |t| t + self.interval))
    }

    /// Emit the coalesced update once its window has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Option<PresenceRecord> {
        match self.next_flush_at() {
            Some(deadline) if now >= deadline => Some(self.mark_sent(now)),
            _ => None,
        }
    }

    /// Unthrottled send, used right after (re)joining a room.
    pub fn force(&mut self, now: Instant) -> PresenceRecord {
        self.mark_sent(now)
    }

    /// A new physical connection: fresh id, remote roster starts empty.
    pub fn reset_connection(&mut self, connection_id: Uuid) {
        self.local.connection_id = connection_id;
        self.roster.clear();
    }

    /// Apply a remote peer's record. Our own echoes are ignored.
    pub fn apply_remote(&mut self, record: PresenceRecord) -> bool {
        if record.connection_id == self.local.connection_id {
            return false;
        }
        self.roster.upsert(record)
    }

    pub fn remove_peer(&mut self, connection_id: &Uuid) -> bool {
        self.roster.remove(connection_id).is_some()
    }

    /// Local connection dropped: nobody else is observable any more.
    pub fn clear_remote(&mut self) -> bool {
        self.roster.clear()
    }

    fn schedule(&mut self, now: Instant) -> Option<PresenceRecord> {
        let window_open = self
            .last_sent
            .is_none_or(|t| now.duration_since(t) >= self.interval);
        if window_open {
            Some(self.mark_sent(now))
        } else {
            self.pending = true;
            None
        }
    }

    fn mark_sent(&mut self, now: Instant) -> PresenceRecord {
        self.last_sent = Some(now);
        self.pending = false;
        self.local.clone()
    }
}
