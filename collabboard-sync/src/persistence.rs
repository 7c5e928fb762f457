//! Persistence bridge between a live document and durable storage.
//!
//! The bridge never sits on the editing path: loads happen once when a room
//! opens, saves run on the blocking pool and report back asynchronously.
//! A failed save leaves the in-memory document untouched and the room dirty,
//! so the next autosave retries.
//!
//! Storage itself is behind [`SnapshotStore`]. Concurrent saves of the same
//! document are resolved by the store (last write wins); the bridge only
//! ever hands over already-converged state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::document::{DocumentChange, DocumentState};
use crate::error::SyncError;
use crate::operation::Operation;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

/// A document at a point in time plus opaque per-user session state.
///
/// `document` and `session` travel as JSON; `preview` (a rendered image) is
/// stored next to it as raw bytes and is not part of the JSON form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub document: DocumentState,
    #[serde(default)]
    pub session: Value,
    #[serde(skip)]
    pub preview: Option<Vec<u8>>,
}

impl Snapshot {
    pub fn new(document: DocumentState) -> Self {
        Self {
            document,
            session: Value::Null,
            preview: None,
        }
    }

    pub fn with_session(mut self, session: Value) -> Self {
        self.session = session;
        self
    }

    pub fn with_preview(mut self, preview: Vec<u8>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8], preview: Option<Vec<u8>>) -> Result<Self, StoreError> {
        let mut snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        snapshot.preview = preview;
        Ok(snapshot)
    }
}

/// Bookkeeping written alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub doc_id: String,
    /// Number of snapshots saved for this document so far.
    pub version: u64,
    pub record_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    pub preview_size: u64,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl SnapshotMetadata {
    pub fn new(doc_id: &str) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
            version: 0,
            record_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            preview_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance for a new save of `snapshot` encoded as `json`.
    pub fn record_save(&mut self, snapshot: &Snapshot, json_len: usize, compressed_len: usize) {
        self.version += 1;
        self.record_count = snapshot.document.records.len() as u64;
        self.snapshot_size = json_len as u64;
        self.compressed_size = compressed_len as u64;
        self.preview_size = snapshot.preview.as_ref().map_or(0, |p| p.len() as u64);
        self.updated_at = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Durable storage collaborator.
///
/// Calls are blocking; async callers go through [`PersistenceBridge`].
pub trait SnapshotStore: Send + Sync {
    /// Last saved snapshot, `None` for a document never saved.
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Upsert the snapshot. Last write wins.
    fn save_snapshot(&self, doc_id: &str, snapshot: &Snapshot) -> Result<SnapshotMetadata, StoreError>;

    /// Journal one accepted operation. Returns its journal sequence.
    fn append_operation(&self, doc_id: &str, op: &Operation) -> Result<u64, StoreError>;

    /// Journalled operations in journal order.
    fn load_operations(&self, doc_id: &str) -> Result<Vec<(u64, Operation)>, StoreError>;

    /// Drop journal entries up to and including `up_to`. Returns the count.
    fn compact_operations(&self, doc_id: &str, up_to: u64) -> Result<u64, StoreError>;

    fn list_documents(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct MemoryEntry {
    snapshot: Option<Vec<u8>>,
    preview: Option<Vec<u8>>,
    metadata: Option<SnapshotMetadata>,
    journal: Vec<(u64, Operation)>,
}

/// In-process store for tests and storage-less servers.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, MemoryEntry>>,
    next_seq: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with an I/O error until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Io("store unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>, StoreError> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Database("memory store poisoned".into()))
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let docs = self.lock()?;
        match docs.get(doc_id).and_then(|e| e.snapshot.as_ref().map(|s| (s, e.preview.clone()))) {
            Some((json, preview)) => Snapshot::from_json(json, preview).map(Some),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, doc_id: &str, snapshot: &Snapshot) -> Result<SnapshotMetadata, StoreError> {
        self.check_writable()?;
        let json = snapshot.to_json()?;
        let mut docs = self.lock()?;
        let entry = docs.entry(doc_id.to_string()).or_default();
        let mut meta = entry
            .metadata
            .take()
            .unwrap_or_else(|| SnapshotMetadata::new(doc_id));
        meta.record_save(snapshot, json.len(), json.len());
        entry.snapshot = Some(json);
        entry.preview = snapshot.preview.clone();
        entry.metadata = Some(meta.clone());
        Ok(meta)
    }

    fn append_operation(&self, doc_id: &str, op: &Operation) -> Result<u64, StoreError> {
        self.check_writable()?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut docs = self.lock()?;
        docs.entry(doc_id.to_string())
            .or_default()
            .journal
            .push((seq, op.clone()));
        Ok(seq)
    }

    fn load_operations(&self, doc_id: &str) -> Result<Vec<(u64, Operation)>, StoreError> {
        let docs = self.lock()?;
        Ok(docs.get(doc_id).map(|e| e.journal.clone()).unwrap_or_default())
    }

    fn compact_operations(&self, doc_id: &str, up_to: u64) -> Result<u64, StoreError> {
        let mut docs = self.lock()?;
        let Some(entry) = docs.get_mut(doc_id) else {
            return Ok(0);
        };
        let before = entry.journal.len();
        entry.journal.retain(|(seq, _)| *seq > up_to);
        Ok((before - entry.journal.len()) as u64)
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let docs = self.lock()?;
        let mut ids: Vec<String> = docs
            .iter()
            .filter(|(_, e)| e.snapshot.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Async, non-blocking access to a [`SnapshotStore`] for one document.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn SnapshotStore>,
    doc_id: String,
    dirty: Arc<AtomicBool>,
    /// Change feed of the tracked document, drained on every dirty check
    changes: Arc<Mutex<Option<broadcast::Receiver<DocumentChange>>>>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn SnapshotStore>, doc_id: impl Into<String>) -> Self {
        Self {
            store,
            doc_id: doc_id.into(),
            dirty: Arc::new(AtomicBool::new(false)),
            changes: Arc::new(Mutex::new(None)),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Last snapshot for this document, called once when a room opens.
    pub async fn load(&self) -> Result<Option<Snapshot>, SyncError> {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        run_blocking(move || store.load_snapshot(&doc_id)).await
    }

    /// Journal entries recorded after the last compaction.
    pub async fn load_operations(&self) -> Result<Vec<(u64, Operation)>, SyncError> {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        run_blocking(move || store.load_operations(&doc_id)).await
    }

    /// Write a snapshot and wait for the store to acknowledge.
    ///
    /// On failure the bridge is marked dirty again so a later save retries.
    pub async fn save(&self, snapshot: Snapshot) -> Result<SnapshotMetadata, SyncError> {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let result = run_blocking(move || store.save_snapshot(&doc_id, &snapshot)).await;
        match &result {
            Ok(meta) => log::info!(
                "Saved snapshot v{} of '{}' ({} records, {} bytes)",
                meta.version,
                self.doc_id,
                meta.record_count,
                meta.compressed_size
            ),
            Err(e) => {
                self.mark_dirty();
                log::error!("Failed to save snapshot of '{}': {e}", self.doc_id);
            }
        }
        result
    }

    /// Fire-and-forget save; the handle yields the outcome.
    pub fn spawn_save(&self, snapshot: Snapshot) -> JoinHandle<Result<SnapshotMetadata, SyncError>> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.save(snapshot).await })
    }

    pub async fn journal(&self, op: Operation) -> Result<u64, SyncError> {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        run_blocking(move || store.append_operation(&doc_id, &op)).await
    }

    pub async fn compact(&self, up_to: u64) -> Result<u64, SyncError> {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        run_blocking(move || store.compact_operations(&doc_id, up_to)).await
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.drain_changes();
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.drain_changes();
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Count every change the document publishes as unsaved.
    ///
    /// The feed is read synchronously by [`is_dirty`](Self::is_dirty) and
    /// [`take_dirty`](Self::take_dirty), so an edit made just before a
    /// check is always seen by it.
    pub fn track(&self, changes: broadcast::Receiver<DocumentChange>) {
        if let Ok(mut slot) = self.changes.lock() {
            *slot = Some(changes);
        }
    }

    fn drain_changes(&self) {
        let Ok(mut slot) = self.changes.lock() else {
            return;
        };
        let Some(feed) = slot.as_mut() else {
            return;
        };
        loop {
            match feed.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.dirty.store(true, Ordering::SeqCst);
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    *slot = None;
                    break;
                }
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(e) => Err(SyncError::Persistence(StoreError::Io(format!("storage task failed: {e}")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicaId;
    use crate::document::Document;
    use crate::operation::Mutation;
    use serde_json::json;

    fn sample_doc() -> Document {
        let mut doc = Document::new(ReplicaId::new("a"));
        doc.local_mutate(Mutation::put(
            "r1",
            "rect",
            [("x".to_string(), json!(1))].into_iter().collect(),
        ))
        .unwrap();
        doc
    }

    #[test]
    fn test_snapshot_json_excludes_preview() {
        let snapshot = Snapshot::new(sample_doc().state())
            .with_session(json!({"camera": {"x": 0, "y": 0, "z": 1}}))
            .with_preview(vec![0x89, b'P', b'N', b'G']);
        let json = snapshot.to_json().unwrap();
        let value: Value = serde_json::from_slice(&json).unwrap();
        assert!(value.get("preview").is_none());

        let restored = Snapshot::from_json(&json, snapshot.preview.clone()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_memory_store_upsert_bumps_version() {
        let store = MemoryStore::new();
        let snapshot = Snapshot::new(sample_doc().state());
        assert_eq!(store.save_snapshot("d", &snapshot).unwrap().version, 1);
        let meta = store.save_snapshot("d", &snapshot).unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.record_count, 1);
        assert_eq!(store.load_snapshot("d").unwrap().unwrap(), snapshot);
        assert!(store.load_snapshot("other").unwrap().is_none());
        assert_eq!(store.list_documents().unwrap(), vec!["d".to_string()]);
    }

    #[test]
    fn test_memory_store_journal_compaction() {
        let store = MemoryStore::new();
        let mut doc = Document::new(ReplicaId::new("a"));
        let mut seqs = Vec::new();
        for i in 0..4 {
            let op = doc
                .local_mutate(Mutation::patch("r", [("i".to_string(), json!(i))].into_iter().collect()))
                .unwrap();
            seqs.push(store.append_operation("d", &op).unwrap());
        }
        assert_eq!(store.compact_operations("d", seqs[1]).unwrap(), 2);
        let remaining = store.load_operations("d").unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].0, seqs[2]);
    }

    #[tokio::test]
    async fn test_bridge_save_and_load() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
        let bridge = PersistenceBridge::new(store, "board");
        assert!(bridge.load().await.unwrap().is_none());

        let snapshot = Snapshot::new(sample_doc().state());
        bridge.save(snapshot.clone()).await.unwrap();
        assert_eq!(bridge.load().await.unwrap().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_failed_save_marks_dirty_and_keeps_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let bridge = PersistenceBridge::new(store.clone(), "board");

        bridge.mark_dirty();
        assert!(bridge.take_dirty());
        let result = bridge.spawn_save(Snapshot::new(sample_doc().state())).await.unwrap();
        assert!(matches!(result, Err(SyncError::Persistence(StoreError::Io(_)))));
        assert!(bridge.is_dirty());

        store.set_failing(false);
        assert!(bridge.load().await.unwrap().is_none());
    }

    #[test]
    fn test_tracked_edit_is_dirty_immediately() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemoryStore::new());
        let bridge = PersistenceBridge::new(store, "board");
        let mut doc = Document::new(ReplicaId::new("a"));
        bridge.track(doc.subscribe());
        assert!(!bridge.is_dirty());

        doc.local_mutate(Mutation::put("r1", "rect", Default::default()))
            .unwrap();
        assert!(bridge.take_dirty());
        assert!(!bridge.take_dirty());

        // A no-op apply publishes nothing.
        let op = doc.local_mutate(Mutation::remove("r1")).unwrap();
        assert!(bridge.take_dirty());
        doc.apply(&op).unwrap();
        assert!(!bridge.is_dirty());

        doc.local_mutate(Mutation::put("r2", "rect", Default::default()))
            .unwrap();
        drop(doc);
        assert!(bridge.is_dirty());
    }
}
