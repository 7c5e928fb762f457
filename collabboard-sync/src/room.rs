//! Rooms: one authoritative replica per document plus peer fan-out.
//!
//! Architecture:
//! ```text
//! peer A ──┐                               ┌── SnapshotStore
//!          ├── serve_peer ── Room(doc_id) ──┤      ├── snapshot (on empty / autosave)
//! peer B ──┘        │          │            │      └── operation journal
//!                   │          ├── Document (replica "room:<doc_id>")
//!                   │          ├── BroadcastGroup (origin-filtered fan-out)
//!                   │          └── presence by connection id
//!                   ▼
//!   SyncStep1 → merge, SyncStep2 back, StateUpdate to others
//!   Operation → validate, merge, journal, fan out, Ack
//!   Presence  → store, fan out
//!   every heartbeat interval → Ping
//!   silence > liveness timeout, Leave, or hang-up → PeerLeft
//! ```
//!
//! A room is created on the first join, seeded from the journal and the
//! last snapshot, and released (after a final save) when its last peer
//! leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::clock::ReplicaId;
use crate::document::{Document, DocumentState};
use crate::error::{ConnectivityError, SyncError};
use crate::persistence::{PersistenceBridge, Snapshot, SnapshotMetadata, SnapshotStore};
use crate::presence::{PresenceRecord, UserInfo};
use crate::protocol::{MessageType, SyncMessage};
use crate::transport::Frame;

/// Room hosting configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Ping every peer this often so idle clients still hear from the room
    pub heartbeat_interval: Duration,
    /// Drop a peer after this long without any frame from it
    pub liveness_timeout: Duration,
    /// Save dirty rooms this often
    pub autosave_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            autosave_interval: Duration::from_secs(30),
        }
    }
}

impl RoomConfig {
    pub fn for_testing() -> Self {
        Self {
            max_peers_per_room: 16,
            broadcast_capacity: 64,
            heartbeat_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(600),
            autosave_interval: Duration::from_millis(100),
        }
    }
}

/// Hub-wide counters.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub active_rooms: usize,
    pub active_peers: u64,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub journalled_operations: u64,
    pub saved_snapshots: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    active_peers: AtomicU64,
    operations_applied: AtomicU64,
    operations_rejected: AtomicU64,
    journalled_operations: AtomicU64,
    saved_snapshots: AtomicU64,
}

/// Document state guarded together with the snapshot extras it is saved with.
struct RoomState {
    document: Document,
    session: serde_json::Value,
    preview: Option<Vec<u8>>,
}

/// One document's room.
pub struct Room {
    doc_id: String,
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
    presence: RwLock<HashMap<Uuid, PresenceRecord>>,
    persistence: PersistenceBridge,
    /// Highest journal sequence whose operation is in `state`
    journal_head: AtomicU64,
}

impl Room {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Copy of the room's replicated state.
    pub async fn document_state(&self) -> DocumentState {
        self.state.lock().await.document.state()
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub async fn presence(&self) -> Vec<PresenceRecord> {
        self.presence.read().await.values().cloned().collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.persistence.is_dirty()
    }

    /// Save the room's converged state.
    ///
    /// Whatever is already stored is merged in first, so a concurrent save
    /// from another replica is never lost. Records that merge changes are
    /// pushed to every connected peer. The opaque session blob and preview
    /// of the stored snapshot are carried forward.
    pub async fn save(&self) -> Result<SnapshotMetadata, SyncError> {
        self.persistence.take_dirty();
        let stored = match self.persistence.load().await {
            Ok(stored) => stored,
            Err(e) => {
                self.persistence.mark_dirty();
                return Err(e);
            }
        };

        let (snapshot, head) = {
            let mut state = self.state.lock().await;
            if let Some(stored) = stored {
                let changes = state.document.merge_state(&stored.document);
                if !changes.is_empty() {
                    log::debug!(
                        "Stored snapshot of '{}' carried {} new changes",
                        self.doc_id,
                        changes.len()
                    );
                    self.publish_state(&state.document.state());
                }
                if !stored.session.is_null() {
                    state.session = stored.session;
                }
                if stored.preview.is_some() {
                    state.preview = stored.preview;
                }
            }
            let snapshot = Snapshot {
                document: state.document.state(),
                session: state.session.clone(),
                preview: state.preview.clone(),
            };
            (snapshot, self.journal_head.load(Ordering::SeqCst))
        };

        let meta = self.persistence.save(snapshot).await?;
        if head > 0 {
            match self.persistence.compact(head).await {
                Ok(n) => log::debug!("Compacted {n} journal entries of '{}'", self.doc_id),
                Err(e) => log::warn!("Journal compaction for '{}' failed: {e}", self.doc_id),
            }
        }
        Ok(meta)
    }

    /// Send the full room state to every peer.
    fn publish_state(&self, state: &DocumentState) {
        let sent = SyncMessage::state_update(Uuid::nil(), &self.doc_id, state)
            .and_then(|msg| self.broadcast.broadcast(Uuid::nil(), &msg));
        if let Err(e) = sent {
            log::warn!("Failed to publish state of '{}': {e}", self.doc_id);
        }
    }
}

/// All rooms hosted by one process.
pub struct RoomHub {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    stats: AtomicHubStats,
}

impl RoomHub {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
            stats: AtomicHubStats::default(),
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub async fn room(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            active_rooms: self.room_count().await,
            active_peers: self.stats.active_peers.load(Ordering::Relaxed),
            operations_applied: self.stats.operations_applied.load(Ordering::Relaxed),
            operations_rejected: self.stats.operations_rejected.load(Ordering::Relaxed),
            journalled_operations: self.stats.journalled_operations.load(Ordering::Relaxed),
            saved_snapshots: self.stats.saved_snapshots.load(Ordering::Relaxed),
        }
    }

    /// Seed a new room: journal first, then snapshot.
    ///
    /// Reading the journal before the snapshot means a concurrent
    /// save-then-compact can never hide operations from us: either we see
    /// the old snapshot with the full journal, or the new snapshot.
    async fn open_room(&self, doc_id: &str) -> Result<Room, SyncError> {
        let persistence = PersistenceBridge::new(self.store.clone(), doc_id);
        let journal = persistence.load_operations().await?;
        let snapshot = persistence.load().await?.unwrap_or_default();

        let replica = ReplicaId::new(format!("room:{doc_id}"));
        let mut document = Document::from_state(replica, snapshot.document);
        let mut head = 0;
        for (seq, op) in &journal {
            if let Err(e) = document.apply(op) {
                log::warn!("Skipping journalled operation {seq} of '{doc_id}': {e}");
            }
            head = head.max(*seq);
        }
        log::info!(
            "Opened room '{doc_id}' ({} records, {} journalled operations)",
            document.len(),
            journal.len()
        );

        Ok(Room {
            doc_id: doc_id.to_string(),
            state: Mutex::new(RoomState {
                document,
                session: snapshot.session,
                preview: snapshot.preview,
            }),
            broadcast: BroadcastGroup::new(self.config.broadcast_capacity),
            presence: RwLock::new(HashMap::new()),
            persistence,
            journal_head: AtomicU64::new(head),
        })
    }

    /// Look up or create the room and register the peer in one step, so a
    /// concurrent release cannot remove the room between the two.
    async fn attach(
        &self,
        doc_id: &str,
        connection_id: Uuid,
        user: UserInfo,
    ) -> Result<(Arc<Room>, broadcast::Receiver<Envelope>), SyncError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                let rx = self.add_to_room(room, connection_id, user).await?;
                return Ok((room.clone(), rx));
            }
        }

        let opened = self.open_room(doc_id).await?;

        let mut rooms = self.rooms.write().await;
        // Someone else may have opened it while we were loading.
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(opened))
            .clone();
        let rx = self.add_to_room(&room, connection_id, user).await?;
        Ok((room, rx))
    }

    async fn add_to_room(
        &self,
        room: &Arc<Room>,
        connection_id: Uuid,
        user: UserInfo,
    ) -> Result<broadcast::Receiver<Envelope>, SyncError> {
        if room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            return Err(ConnectivityError::RoomFull(room.doc_id.clone()).into());
        }
        room.presence.write().await.insert(
            connection_id,
            PresenceRecord {
                connection_id,
                user: user.clone(),
                cursor: None,
            },
        );
        Ok(room.broadcast.add_peer(connection_id, user).await)
    }

    /// Remove the peer; the last one out saves and releases the room.
    async fn detach(&self, room: &Arc<Room>, connection_id: Uuid) {
        room.broadcast.remove_peer(&connection_id).await;
        room.presence.write().await.remove(&connection_id);
        if let Err(e) = room
            .broadcast
            .broadcast(Uuid::nil(), &SyncMessage::peer_left(connection_id, &room.doc_id))
        {
            log::warn!("Failed to announce departure in '{}': {e}", room.doc_id);
        }

        let released = {
            let mut rooms = self.rooms.write().await;
            let same_room = rooms.get(&room.doc_id).is_some_and(|r| Arc::ptr_eq(r, room));
            if same_room && room.broadcast.peer_count().await == 0 {
                rooms.remove(&room.doc_id);
                true
            } else {
                false
            }
        };

        if released {
            log::info!("Room '{}' is empty, releasing", room.doc_id);
            if room.is_dirty() {
                self.save_room(room).await;
            }
        }
    }

    async fn save_room(&self, room: &Room) {
        match room.save().await {
            Ok(_) => {
                self.stats.saved_snapshots.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Snapshot of '{}' failed: {e}", room.doc_id),
        }
    }

    /// Save every dirty room once.
    pub async fn save_dirty_rooms(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut saved = 0;
        for room in rooms.iter().filter(|r| r.is_dirty()) {
            self.save_room(room).await;
            saved += 1;
        }
        saved
    }

    /// Periodic autosave of dirty rooms.
    pub fn spawn_autosave(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.autosave_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let saved = hub.save_dirty_rooms().await;
                if saved > 0 {
                    log::debug!("Autosaved {saved} rooms");
                }
            }
        })
    }

    /// Run the room protocol for one connection until it ends.
    ///
    /// The first frame must be `PeerJoined`; it names the room and the
    /// connection id.
    pub async fn serve_peer(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<Frame>,
        outgoing: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), SyncError> {
        let hello = match timeout(self.config.liveness_timeout, incoming.recv()).await {
            Ok(Some(frame)) => SyncMessage::decode(&frame)?,
            Ok(None) => return Ok(()),
            Err(_) => return Err(ConnectivityError::Timeout(self.config.liveness_timeout).into()),
        };
        if hello.msg_type != MessageType::PeerJoined {
            log::warn!("Expected PeerJoined, got {:?}", hello.msg_type);
            return Err(crate::protocol::ProtocolError::UnexpectedMessage.into());
        }

        let connection_id = hello.peer_id;
        let doc_id = hello.doc_id.clone();
        let user = hello.user_info()?;
        let (room, rx) = self.attach(&doc_id, connection_id, user.clone()).await?;
        self.stats.active_peers.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Peer {} ({connection_id}) joined '{doc_id}'",
            user.display_name
        );

        let mut peer = PeerSession {
            hub: self.as_ref(),
            room: &room,
            connection_id,
            outgoing,
        };
        let result = peer.run(incoming, rx, hello).await;

        self.detach(&room, connection_id).await;
        self.stats.active_peers.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {connection_id} left '{doc_id}'");
        result
    }
}

/// Why a peer loop ended.
enum Exit {
    Leave,
    HungUp,
    Silent,
}

struct PeerSession<'a> {
    hub: &'a RoomHub,
    room: &'a Arc<Room>,
    connection_id: Uuid,
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl PeerSession<'_> {
    async fn run(
        &mut self,
        mut incoming: mpsc::UnboundedReceiver<Frame>,
        mut rx: broadcast::Receiver<Envelope>,
        hello: SyncMessage,
    ) -> Result<(), SyncError> {
        // Announce the joiner and show it everyone already here.
        self.room.broadcast.broadcast(self.connection_id, &hello)?;
        let present: Vec<PresenceRecord> = self
            .room
            .presence
            .read()
            .await
            .values()
            .filter(|p| p.connection_id != self.connection_id)
            .cloned()
            .collect();
        for record in &present {
            self.send(&SyncMessage::presence(record.connection_id, &self.room.doc_id, record)?)?;
        }

        let liveness = self.hub.config.liveness_timeout;
        let mut deadline = Instant::now() + liveness;
        let period = self.hub.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                frame = incoming.recv() => {
                    let Some(frame) = frame else { break Exit::HungUp };
                    deadline = Instant::now() + liveness;
                    match SyncMessage::decode(&frame) {
                        Ok(msg) => {
                            if msg.msg_type == MessageType::Leave {
                                break Exit::Leave;
                            }
                            match self.handle(msg, frame).await {
                                Ok(()) => {}
                                Err(SyncError::Connectivity(_)) => break Exit::HungUp,
                                Err(e) => log::warn!("Bad message from {}: {e}", self.connection_id),
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame from {}: {e}", self.connection_id),
                    }
                }
                envelope = rx.recv() => match envelope {
                    Ok(envelope) => {
                        if envelope.is_for(&self.connection_id) {
                            self.send_raw(envelope.frame.as_ref().clone())?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {} lagged by {n} frames, resending room state", self.connection_id);
                        self.room.broadcast.record_dropped(n);
                        let state = self.room.document_state().await;
                        self.send(&SyncMessage::state_update(Uuid::nil(), &self.room.doc_id, &state)?)?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break Exit::HungUp,
                },
                _ = heartbeat.tick() => {
                    if self.send(&SyncMessage::ping(Uuid::nil())).is_err() {
                        break Exit::HungUp;
                    }
                }
                _ = sleep_until(deadline) => break Exit::Silent,
            }
        };

        match exit {
            Exit::Leave => log::debug!("Peer {} sent Leave", self.connection_id),
            Exit::HungUp => log::debug!("Peer {} hung up", self.connection_id),
            Exit::Silent => log::warn!(
                "Peer {} silent for {liveness:?}, dropping",
                self.connection_id
            ),
        }
        Ok(())
    }

    async fn handle(&mut self, msg: SyncMessage, frame: Frame) -> Result<(), SyncError> {
        let doc_id = self.room.doc_id.clone();
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let incoming = msg.document_state()?;
                let changed = {
                    let mut state = self.room.state.lock().await;
                    !state.document.merge_state(&incoming).is_empty()
                };
                if changed {
                    // Contributed state has no journal entry; it is durable
                    // only once a snapshot holding it is written.
                    log::debug!("Joiner {} contributed state to '{doc_id}'", self.connection_id);
                    self.room.persistence.mark_dirty();
                    self.hub.save_room(self.room).await;
                }
                let merged = self.room.document_state().await;
                self.send(&SyncMessage::sync_step2(Uuid::nil(), &doc_id, &merged)?)?;
                if changed {
                    self.room
                        .broadcast
                        .broadcast(self.connection_id, &SyncMessage::state_update(Uuid::nil(), &doc_id, &merged)?)?;
                }
            }

            MessageType::Operation => {
                let op = msg.operation_payload()?;
                let applied = {
                    let mut state = self.room.state.lock().await;
                    state.document.apply(&op)
                };
                match applied {
                    Ok(changes) => {
                        self.hub.stats.operations_applied.fetch_add(1, Ordering::Relaxed);
                        // Fan out even when the room had it already: a peer
                        // may not have.
                        self.room.broadcast.broadcast_raw(Envelope {
                            origin: self.connection_id,
                            frame: Arc::new(frame),
                        });
                        if !changes.is_empty() {
                            self.room.persistence.mark_dirty();
                            self.journal(op.clone()).await;
                        }
                    }
                    Err(e) => {
                        self.hub.stats.operations_rejected.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Dropping operation from {}: {e}", self.connection_id);
                    }
                }
                // Acked either way so a malformed op is not retried forever.
                self.send(&SyncMessage::ack(Uuid::nil(), &doc_id, op.id.seq))?;
            }

            MessageType::Presence => {
                let mut record = msg.presence_record()?;
                record.connection_id = self.connection_id;
                self.room
                    .presence
                    .write()
                    .await
                    .insert(self.connection_id, record.clone());
                self.room.broadcast.broadcast(
                    self.connection_id,
                    &SyncMessage::presence(self.connection_id, &doc_id, &record)?,
                )?;
            }

            MessageType::Ping => {
                self.send(&SyncMessage::pong(Uuid::nil()))?;
            }

            MessageType::Pong => {}

            other => {
                log::debug!("Ignoring {other:?} from {}", self.connection_id);
            }
        }
        Ok(())
    }

    async fn journal(&self, op: crate::operation::Operation) {
        match self.room.persistence.journal(op).await {
            Ok(seq) => {
                self.room.journal_head.fetch_max(seq, Ordering::SeqCst);
                self.hub
                    .stats
                    .journalled_operations
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Failed to journal operation for '{}': {e}", self.room.doc_id),
        }
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), SyncError> {
        self.send_raw(msg.encode()?)
    }

    fn send_raw(&self, frame: Frame) -> Result<(), SyncError> {
        self.outgoing
            .send(frame)
            .map_err(|_| SyncError::from(ConnectivityError::Closed))
    }
}
