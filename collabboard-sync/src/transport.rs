//! Transport abstraction: how a session reaches its room.
//!
//! A [`Connection`] is a pair of unbounded frame channels. Sending never
//! blocks the caller; the transport drains the outgoing side on its own
//! task, which keeps draining after the session has gone away.
//!
//! - [`WsTransport`] dials a [`SyncServer`](crate::server::SyncServer) over
//!   WebSocket.
//! - [`LocalTransport`] attaches straight to an in-process [`RoomHub`] and can
//!   be switched offline to simulate a partition.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{ConnectivityError, SyncError};
use crate::room::RoomHub;

/// One encoded [`SyncMessage`](crate::protocol::SyncMessage).
pub type Frame = Vec<u8>;

/// A live, bidirectional link to a room.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

/// Realtime transport collaborator.
pub trait Transport: Send + Sync {
    /// Open a fresh connection to the room for `doc_id`.
    fn connect(&self, doc_id: &str) -> impl Future<Output = Result<Connection, SyncError>> + Send;
}

/// WebSocket transport. Rooms live at `{url}/{doc_id}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Transport for WsTransport {
    async fn connect(&self, doc_id: &str) -> Result<Connection, SyncError> {
        let url = format!("{}/{}", self.url, doc_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            ConnectivityError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;
        log::debug!("WebSocket connected to {url}");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        // Writer: drains queued frames even after the session dropped its sender.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                    log::warn!("WebSocket send failed: {e}");
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket receive error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// In-process transport backed by a [`RoomHub`].
///
/// Clones share the online switch, so a test can hold one clone while a
/// session owns another.
#[derive(Clone)]
pub struct LocalTransport {
    hub: Arc<RoomHub>,
    online: Arc<watch::Sender<bool>>,
}

impl LocalTransport {
    pub fn new(hub: Arc<RoomHub>) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            hub,
            online: Arc::new(online),
        }
    }

    /// Going offline severs every open connection and refuses new ones.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}

impl Transport for LocalTransport {
    async fn connect(&self, doc_id: &str) -> Result<Connection, SyncError> {
        if !self.is_online() {
            return Err(ConnectivityError::Offline.into());
        }

        let (client_out_tx, mut client_out_rx) = mpsc::unbounded_channel::<Frame>();
        let (client_in_tx, client_in_rx) = mpsc::unbounded_channel::<Frame>();
        let (hub_in_tx, hub_in_rx) = mpsc::unbounded_channel::<Frame>();
        let (hub_out_tx, mut hub_out_rx) = mpsc::unbounded_channel::<Frame>();

        let hub = self.hub.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.serve_peer(hub_in_rx, hub_out_tx).await {
                log::debug!("Local peer ended: {e}");
            }
        });

        // Relay between the two sides until either hangs up or we go offline.
        let mut online = self.online.subscribe();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = client_out_rx.recv() => match frame {
                        Some(frame) => {
                            if hub_in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = hub_out_rx.recv() => match frame {
                        Some(frame) => {
                            if client_in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    changed = online.changed() => {
                        if changed.is_err() || !*online.borrow_and_update() {
                            log::debug!("Local transport for '{doc_id}' went offline");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: client_out_tx,
            incoming: client_in_rx,
        })
    }
}
