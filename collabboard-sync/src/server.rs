//! WebSocket front end: each socket is routed to the room named in its join frame.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/<doc_id>
//!            ├── accept_async ── frame bridge ── RoomHub::serve_peer
//! Client B ──┘                                        │
//!                                                     ├── Room(doc_id)
//!                                                     └── SnapshotStore
//!                                                          ├── MemoryStore (no storage_path)
//!                                                          └── DocumentStore (RocksDB)
//! ```
//!
//! The server is a thin shell: each accepted socket becomes a pair of frame
//! channels handed to the hub, which owns every protocol decision.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::persistence::{MemoryStore, SnapshotStore};
use crate::room::{RoomConfig, RoomHub};
use crate::storage::{DocumentStore, StoreConfig};
use crate::transport::Frame;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this many peers in one room are refused
    pub max_peers_per_room: usize,
    /// Frames a slow peer may lag before it starts missing them
    pub broadcast_capacity: usize,
    /// Interval between room pings to each client, in seconds
    pub heartbeat_interval_secs: u64,
    /// Drop peers silent for this long, in seconds
    pub liveness_timeout_secs: u64,
    /// Save dirty rooms this often, in seconds
    pub autosave_interval_secs: u64,
    /// RocksDB directory; rooms live only in memory when unset
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 5,
            liveness_timeout_secs: 15,
            autosave_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_peers_per_room: self.max_peers_per_room,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            autosave_interval: Duration::from_secs(self.autosave_interval_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub journalled_operations: u64,
    pub saved_snapshots: u64,
}

#[derive(Default)]
struct ConnectionCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
    counters: Arc<ConnectionCounters>,
}

impl SyncServer {
    /// Create a server; opens the RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, SyncError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(DocumentStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let hub = Arc::new(RoomHub::new(store, config.room_config()));
        Self {
            config,
            hub,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        let hub = self.hub.stats().await;
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: hub.active_rooms,
            journalled_operations: hub.journalled_operations,
            saved_snapshots: hub.saved_snapshots,
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Accepting board connections on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let autosave = self.hub.spawn_autosave();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            log::debug!("Accepted socket from {addr}");

            let hub = self.hub.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, counters).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        };
        autosave.abort();
        result
    }

    /// Bridge one WebSocket to the hub.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RoomHub>,
        counters: Arc<ConnectionCounters>,
    ) -> Result<(), SyncError> {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Board client connected from {addr}");

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                    log::debug!("Send to {addr} failed: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_counters = counters.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        reader_counters.total_messages.fetch_add(1, Ordering::Relaxed);
                        reader_counters
                            .total_bytes
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        if in_tx.send(data.into()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        log::debug!("Close frame from {addr}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }
        });

        let result = hub.serve_peer(in_rx, out_tx).await;

        // serve_peer dropped its sender, so the writer flushes and closes.
        reader.abort();
        let _ = writer.await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} closed");
        result
    }
}
