//! Client session: one replica attached to one room.
//!
//! Provides:
//! - Join handshake (full-state exchange, bounded by `join_timeout`)
//! - Local mutations that never wait on the network
//! - Outbox of unacknowledged operations, replayed in order on reconnect
//! - Heartbeat, liveness and exponential-backoff reconnect
//! - Coalesced presence and the remote roster
//! - Optional snapshot saves through a [`PersistenceBridge`]
//!
//! The session is driven by [`SyncSession::next_event`]: every document
//! mutation happens on the task that calls it, so the document needs no
//! locking.
//!
//! ```text
//!              ┌──────────────── SyncSession ─────────────────┐
//! local edit ─►│ Document ──► Outbox ──► Link.outgoing ───────┼──► room
//!              │    ▲                                          │
//!              │    └── merge / apply ◄── Link.incoming ◄──────┼─── room
//!              │ PresenceLayer (40ms coalescing, roster)       │
//!              └──────────────── next_event() ─────────────────┘
//! ```

use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::clock::ReplicaId;
use crate::document::{Document, DocumentState};
use crate::error::{ConnectivityError, SyncError};
use crate::operation::{Mutation, Operation};
use crate::persistence::{PersistenceBridge, Snapshot, SnapshotMetadata};
use crate::presence::{Cursor, PresenceLayer, PresenceRecord, Roster, UserInfo, DEFAULT_PRESENCE_INTERVAL};
use crate::protocol::{MessageType, SyncMessage};
use crate::record::RecordChange;
use crate::transport::{Frame, Transport};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Replica identity; a random one is generated when absent
    pub replica_id: Option<ReplicaId>,
    /// Upper bound on the join handshake
    pub join_timeout: Duration,
    /// Ping period while connected
    pub heartbeat_interval: Duration,
    /// Treat the link as lost after this long without a frame
    pub liveness_timeout: Duration,
    /// Presence coalescing window
    pub presence_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Maximum unacknowledged operations kept for replay
    pub outbox_capacity: usize,
    /// Save while dirty this often (requires an attached bridge)
    pub autosave_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            outbox_capacity: 10_000,
            autosave_interval: None,
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            replica_id: None,
            join_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_millis(500),
            presence_interval: Duration::from_millis(20),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            outbox_capacity: 1_000,
            autosave_interval: None,
        }
    }

    pub fn with_replica(mut self, replica: impl Into<ReplicaId>) -> Self {
        self.replica_id = Some(replica.into());
        self
    }
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Events emitted by [`SyncSession::next_event`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An operation from the room, delivered at least once
    RemoteOperation {
        op: Operation,
        changes: Vec<RecordChange>,
    },
    /// A full room state was merged in (handshake or peer contribution)
    StateMerged(Vec<RecordChange>),
    /// Full roster after any remote presence change
    PresenceChanged(Roster),
    ConnectionChanged(ConnectionState),
    Saved(SnapshotMetadata),
    SaveFailed(String),
}

/// FIFO of local operations the room has not acknowledged yet.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Operation>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue an operation. At capacity the oldest entry is dropped; the
    /// state handshake on reconnect still carries its effect.
    pub fn push(&mut self, op: Operation) {
        if self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "Outbox full ({}), dropping operation {}:{}",
                    self.capacity,
                    oldest.id.replica,
                    oldest.id.seq
                );
            }
        }
        self.queue.push_back(op);
    }

    /// Forget everything up to and including `seq`.
    pub fn ack(&mut self, seq: u64) -> usize {
        let before = self.queue.len();
        while self.queue.front().is_some_and(|op| op.id.seq <= seq) {
            self.queue.pop_front();
        }
        before - self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Exponential reconnect delay with a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// An established connection to the room.
struct Link {
    outgoing: mpsc::UnboundedSender<Frame>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

/// What woke the event loop.
enum Wake {
    Frame(Option<Frame>),
    Heartbeat,
    Silent,
    PresenceFlush,
    Reconnect,
    SaveDone(Result<Result<SnapshotMetadata, SyncError>, JoinError>),
    Autosave,
}

pub type SaveHandle = JoinHandle<Result<SnapshotMetadata, SyncError>>;

/// A replica's membership in one room.
pub struct SyncSession<T: Transport> {
    transport: T,
    doc_id: String,
    config: SessionConfig,
    document: Document,
    presence: PresenceLayer,
    outbox: Outbox,
    link: Option<Link>,
    state: ConnectionState,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    last_heard: Instant,
    next_heartbeat: Instant,
    events: VecDeque<SessionEvent>,

    persistence: Option<PersistenceBridge>,
    session_state: Value,
    pending_save: Option<SaveHandle>,
    queued_save: Option<Option<Vec<u8>>>,
    next_autosave: Option<Instant>,
}

impl<T: Transport> SyncSession<T> {
    /// Join the room for `doc_id`.
    ///
    /// Returns once the room's state has been merged with `initial`, so the
    /// caller never observes anything older than its own snapshot. Fails with
    /// a connectivity error if that takes longer than `join_timeout`.
    pub async fn join(
        transport: T,
        doc_id: impl Into<String>,
        initial: Option<Snapshot>,
        user: UserInfo,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let replica = config.replica_id.clone().unwrap_or_else(ReplicaId::random);
        let (document, session_state) = match initial {
            Some(snapshot) => (Document::from_state(replica, snapshot.document), snapshot.session),
            None => (Document::new(replica), Value::Null),
        };
        let now = Instant::now();
        let mut session = Self {
            transport,
            doc_id: doc_id.into(),
            presence: PresenceLayer::new(Uuid::new_v4(), user, config.presence_interval),
            outbox: Outbox::new(config.outbox_capacity),
            backoff: Backoff::new(config.reconnect_initial, config.reconnect_max),
            config,
            document,
            link: None,
            state: ConnectionState::Connecting,
            reconnect_at: None,
            last_heard: now,
            next_heartbeat: now,
            events: VecDeque::new(),
            persistence: None,
            session_state,
            pending_save: None,
            queued_save: None,
            next_autosave: None,
        };

        let join_timeout = session.config.join_timeout;
        let link = match timeout(join_timeout, session.handshake()).await {
            Ok(result) => result?,
            Err(_) => {
                log::warn!("Join of '{}' timed out after {join_timeout:?}", session.doc_id);
                return Err(ConnectivityError::Timeout(join_timeout).into());
            }
        };
        session.on_connected(link);
        log::info!(
            "Replica {} joined '{}' ({} records)",
            session.document.replica(),
            session.doc_id,
            session.document.len()
        );
        Ok(session)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        self.presence.roster()
    }

    pub fn local_presence(&self) -> &PresenceRecord {
        self.presence.local()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Apply a local edit and send it. Never waits on the network.
    pub fn local_mutate(&mut self, mutation: Mutation) -> Result<Operation, SyncError> {
        let op = self.document.local_mutate(mutation)?;
        self.outbox.push(op.clone());
        if self.link.is_some() {
            self.send_operation(&op);
        }
        Ok(op)
    }

    /// Move the local cursor; sent at most once per presence window.
    pub fn set_local_presence(&mut self, cursor: Option<Cursor>) {
        if let Some(record) = self.presence.set_cursor(cursor, Instant::now()) {
            self.send_presence(&record);
        }
    }

    pub fn set_local_user(&mut self, user: UserInfo) {
        if let Some(record) = self.presence.set_user(user, Instant::now()) {
            self.send_presence(&record);
        }
    }

    /// Enable snapshot saves. Document changes mark the bridge dirty.
    pub fn attach_persistence(&mut self, bridge: PersistenceBridge) {
        bridge.track(self.document.subscribe());
        self.next_autosave = self.config.autosave_interval.map(|i| Instant::now() + i);
        self.persistence = Some(bridge);
    }

    /// Opaque per-user state stored with the next snapshot.
    pub fn set_session_state(&mut self, session: Value) {
        self.session_state = session;
    }

    /// Snapshot of the converged document.
    pub fn snapshot(&self, session: Value) -> Snapshot {
        Snapshot {
            document: self.document.state(),
            session,
            preview: None,
        }
    }

    /// Start an asynchronous save. The outcome arrives as
    /// [`SessionEvent::Saved`] or [`SessionEvent::SaveFailed`].
    ///
    /// Returns false when no bridge is attached.
    pub fn save(&mut self, preview: Option<Vec<u8>>) -> bool {
        if self.persistence.is_none() {
            log::warn!("Save requested for '{}' without persistence", self.doc_id);
            return false;
        }
        if self.pending_save.is_some() {
            self.queued_save = Some(preview);
        } else {
            self.start_save(preview);
        }
        true
    }

    fn start_save(&mut self, preview: Option<Vec<u8>>) {
        let Some(bridge) = &self.persistence else {
            return;
        };
        bridge.take_dirty();
        let snapshot = Snapshot {
            document: self.document.state(),
            session: self.session_state.clone(),
            preview,
        };
        self.pending_save = Some(bridge.spawn_save(snapshot));
    }

    /// Leave the room without waiting for anything to be delivered.
    ///
    /// A dirty document gets a final save; the handle yields its outcome.
    pub fn leave(mut self) -> Option<SaveHandle> {
        if let Some(link) = self.link.take() {
            let msg = SyncMessage::leave(self.presence.connection_id(), &self.doc_id);
            match msg.encode() {
                Ok(frame) => {
                    let _ = link.outgoing.send(frame);
                }
                Err(e) => log::warn!("Failed to encode Leave: {e}"),
            }
        }
        self.state = ConnectionState::Disconnected;
        log::info!("Replica {} left '{}'", self.document.replica(), self.doc_id);

        let bridge = self.persistence.take()?;
        if !bridge.take_dirty() {
            return None;
        }
        Some(bridge.spawn_save(Snapshot {
            document: self.document.state(),
            session: std::mem::take(&mut self.session_state),
            preview: None,
        }))
    }

    /// Drive the session until it has something to report.
    ///
    /// Cancel-safe: dropping the returned future loses no frames and no
    /// scheduled work.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }

            let connected = self.link.is_some();
            let far = Instant::now() + Duration::from_secs(86_400);
            let liveness_at = self.last_heard + self.config.liveness_timeout;
            let flush_at = self.presence.next_flush_at();
            let saving = self.pending_save.is_some();

            let wake = {
                let link = self.link.as_mut();
                let save = self.pending_save.as_mut();
                tokio::select! {
                    frame = recv_frame(link), if connected => Wake::Frame(frame),
                    _ = sleep_until(self.next_heartbeat), if connected => Wake::Heartbeat,
                    _ = sleep_until(liveness_at), if connected => Wake::Silent,
                    _ = sleep_until(flush_at.unwrap_or(far)), if connected && flush_at.is_some() => Wake::PresenceFlush,
                    _ = sleep_until(self.reconnect_at.unwrap_or(far)), if self.reconnect_at.is_some() => Wake::Reconnect,
                    result = join_save(save), if saving => Wake::SaveDone(result),
                    _ = sleep_until(self.next_autosave.unwrap_or(far)), if self.next_autosave.is_some() => Wake::Autosave,
                    else => return None,
                }
            };

            match wake {
                Wake::Frame(Some(frame)) => {
                    self.last_heard = Instant::now();
                    match SyncMessage::decode(&frame) {
                        Ok(msg) => self.handle_message(msg),
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    }
                }
                Wake::Frame(None) => self.connection_lost("room closed the connection"),
                Wake::Heartbeat => {
                    self.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
                    self.send(&SyncMessage::ping(self.presence.connection_id()));
                }
                Wake::Silent => self.connection_lost("room went silent"),
                Wake::PresenceFlush => {
                    if let Some(record) = self.presence.flush_due(Instant::now()) {
                        self.send_presence(&record);
                    }
                }
                Wake::Reconnect => self.reconnect().await,
                Wake::SaveDone(result) => {
                    self.pending_save = None;
                    let event = match result {
                        Ok(Ok(meta)) => SessionEvent::Saved(meta),
                        Ok(Err(e)) => SessionEvent::SaveFailed(e.to_string()),
                        Err(e) => SessionEvent::SaveFailed(format!("save task failed: {e}")),
                    };
                    self.events.push_back(event);
                    if let Some(preview) = self.queued_save.take() {
                        self.start_save(preview);
                    }
                }
                Wake::Autosave => {
                    self.next_autosave = self.config.autosave_interval.map(|i| Instant::now() + i);
                    let dirty = self.persistence.as_ref().is_some_and(|b| b.is_dirty());
                    if dirty && self.pending_save.is_none() {
                        log::debug!("Autosaving '{}'", self.doc_id);
                        self.start_save(None);
                    }
                }
            }
        }
    }

    /// Connect, announce ourselves and exchange full states.
    ///
    /// The link is only handed back once the room's state is merged, so a
    /// cancelled handshake leaves the session disconnected.
    async fn handshake(&mut self) -> Result<Link, SyncError> {
        let conn = self.transport.connect(&self.doc_id).await?;
        let connection_id = Uuid::new_v4();
        self.presence.reset_connection(connection_id);

        let hello = SyncMessage::peer_joined(connection_id, &self.doc_id, &self.presence.local().user)?;
        let step1 = SyncMessage::sync_step1(connection_id, &self.doc_id, self.document.state_ref())?;
        let mut link = Link {
            outgoing: conn.outgoing,
            incoming: conn.incoming,
        };
        for msg in [hello, step1] {
            link.outgoing
                .send(msg.encode()?)
                .map_err(|_| ConnectivityError::Closed)?;
        }

        loop {
            let Some(frame) = link.incoming.recv().await else {
                return Err(ConnectivityError::Closed.into());
            };
            let msg = match SyncMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Dropping undecodable frame during join: {e}");
                    continue;
                }
            };
            let done = msg.msg_type == MessageType::SyncStep2;
            self.handle_message(msg);
            if done {
                return Ok(link);
            }
        }
    }

    fn on_connected(&mut self, link: Link) {
        let now = Instant::now();
        self.link = Some(link);
        self.state = ConnectionState::Connected;
        self.backoff.reset();
        self.reconnect_at = None;
        self.last_heard = now;
        self.next_heartbeat = now + self.config.heartbeat_interval;

        let pending: Vec<Operation> = self.outbox.iter().cloned().collect();
        if !pending.is_empty() {
            log::info!("Replaying {} queued operations to '{}'", pending.len(), self.doc_id);
        }
        for op in &pending {
            self.send_operation(op);
        }
        let record = self.presence.force(now);
        self.send_presence(&record);
        self.events
            .push_back(SessionEvent::ConnectionChanged(ConnectionState::Connected));
    }

    async fn reconnect(&mut self) {
        // reconnect_at stays set until the attempt settles, so a cancelled
        // attempt is retried on the next call.
        let join_timeout = self.config.join_timeout;
        let error = match timeout(join_timeout, self.handshake()).await {
            Ok(Ok(link)) => {
                log::info!("Reconnected to '{}'", self.doc_id);
                self.on_connected(link);
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => ConnectivityError::Timeout(join_timeout).into(),
        };
        let delay = self.backoff.next_delay();
        log::debug!("Reconnect to '{}' failed ({error}), retrying in {delay:?}", self.doc_id);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn connection_lost(&mut self, reason: &str) {
        if self.link.take().is_none() {
            return;
        }
        log::warn!("Lost connection to '{}': {reason}", self.doc_id);
        self.state = ConnectionState::Reconnecting;
        if self.presence.clear_remote() {
            self.events
                .push_back(SessionEvent::PresenceChanged(self.presence.roster().clone()));
        }
        self.events
            .push_back(SessionEvent::ConnectionChanged(ConnectionState::Reconnecting));
        self.reconnect_at = Some(Instant::now() + self.backoff.next_delay());
    }

    fn handle_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Operation => {
                let op = match msg.operation_payload() {
                    Ok(op) => op,
                    Err(e) => {
                        log::warn!("Dropping operation frame: {e}");
                        return;
                    }
                };
                match self.document.apply(&op) {
                    Ok(changes) => self
                        .events
                        .push_back(SessionEvent::RemoteOperation { op, changes }),
                    Err(e) => log::warn!("Dropping operation {}:{}: {e}", op.id.replica, op.id.seq),
                }
            }

            MessageType::SyncStep2 | MessageType::StateUpdate => match msg.document_state() {
                Ok(state) => self.merge_room_state(&state),
                Err(e) => log::warn!("Dropping state frame: {e}"),
            },

            MessageType::Ack => {
                let acked = self.outbox.ack(msg.clock);
                log::trace!("Room acked up to {} ({acked} released)", msg.clock);
            }

            MessageType::Presence => match msg.presence_record() {
                Ok(record) => {
                    if self.presence.apply_remote(record) {
                        self.publish_roster();
                    }
                }
                Err(e) => log::warn!("Dropping presence frame: {e}"),
            },

            MessageType::PeerJoined => match msg.user_info() {
                Ok(user) => {
                    let record = PresenceRecord {
                        connection_id: msg.peer_id,
                        user,
                        cursor: None,
                    };
                    if self.presence.apply_remote(record) {
                        self.publish_roster();
                    }
                }
                Err(e) => log::warn!("Dropping PeerJoined frame: {e}"),
            },

            MessageType::PeerLeft => {
                if self.presence.remove_peer(&msg.peer_id) {
                    self.publish_roster();
                }
            }

            MessageType::Ping => self.send(&SyncMessage::pong(self.presence.connection_id())),

            MessageType::Pong => {}

            other => log::debug!("Ignoring {other:?} from room"),
        }
    }

    fn merge_room_state(&mut self, state: &DocumentState) {
        let changes = self.document.merge_state(state);
        if !changes.is_empty() {
            self.events.push_back(SessionEvent::StateMerged(changes));
        }
    }

    fn publish_roster(&mut self) {
        self.events
            .push_back(SessionEvent::PresenceChanged(self.presence.roster().clone()));
    }

    fn send_operation(&mut self, op: &Operation) {
        match SyncMessage::operation(self.presence.connection_id(), &self.doc_id, op) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::error!("Failed to encode operation: {e}"),
        }
    }

    fn send_presence(&mut self, record: &PresenceRecord) {
        if self.link.is_none() {
            return;
        }
        match SyncMessage::presence(record.connection_id, &self.doc_id, record) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::error!("Failed to encode presence: {e}"),
        }
    }

    fn send(&mut self, msg: &SyncMessage) {
        let Some(link) = &self.link else {
            return;
        };
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type);
                return;
            }
        };
        if link.outgoing.send(frame).is_err() {
            self.connection_lost("transport closed");
        }
    }
}

async fn recv_frame(link: Option<&mut Link>) -> Option<Frame> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_save(
    handle: Option<&mut SaveHandle>,
) -> Result<Result<SnapshotMetadata, SyncError>, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
