//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ var str  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` is the sender's connection id. Payloads:
//!
//! | Type | Payload |
//! |------|---------|
//! | SyncStep1 / SyncStep2 / StateUpdate | LZ4(JSON `DocumentState`) |
//! | Operation | JSON `Operation` (`clock` = op sequence) |
//! | Ack | empty (`clock` = highest accepted sequence) |
//! | Presence | JSON `PresenceRecord` |
//! | PeerJoined | JSON `UserInfo` |
//! | PeerLeft / Leave / Ping / Pong | empty |
//!
//! Field values are free-form JSON, which bincode's non-self-describing
//! format cannot decode, so document payloads stay JSON inside the binary
//! envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentState;
use crate::operation::Operation;
use crate::presence::{PresenceRecord, UserInfo};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Joiner's full state
    SyncStep1 = 1,
    /// Room's merged state, reply to SyncStep1
    SyncStep2 = 2,
    /// Single document operation
    Operation = 3,
    /// Ephemeral cursor / identity update
    Presence = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Room accepted operations up to `clock`
    Ack = 9,
    /// Room state changed by a joiner's contribution
    StateUpdate = 10,
    /// Clean disconnect
    Leave = 11,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Sequence number for Operation / Ack, sender's Lamport time otherwise
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    /// Joiner's full state (handshake request).
    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state: &DocumentState) -> Result<Self, ProtocolError> {
        let clock = state.max_timestamp();
        Ok(Self::new(MessageType::SyncStep1, peer_id, doc_id, clock, encode_state(state)?))
    }

    /// Room's merged state (handshake reply).
    pub fn sync_step2(peer_id: Uuid, doc_id: &str, state: &DocumentState) -> Result<Self, ProtocolError> {
        let clock = state.max_timestamp();
        Ok(Self::new(MessageType::SyncStep2, peer_id, doc_id, clock, encode_state(state)?))
    }

    /// Room state pushed to peers after a joiner contributed new content.
    pub fn state_update(peer_id: Uuid, doc_id: &str, state: &DocumentState) -> Result<Self, ProtocolError> {
        let clock = state.max_timestamp();
        Ok(Self::new(MessageType::StateUpdate, peer_id, doc_id, clock, encode_state(state)?))
    }

    /// A single operation.
    pub fn operation(peer_id: Uuid, doc_id: &str, op: &Operation) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(op).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Operation, peer_id, doc_id, op.id.seq, payload))
    }

    /// Acknowledge operations up to and including `seq`.
    pub fn ack(peer_id: Uuid, doc_id: &str, seq: u64) -> Self {
        Self::new(MessageType::Ack, peer_id, doc_id, seq, Vec::new())
    }

    pub fn presence(peer_id: Uuid, doc_id: &str, record: &PresenceRecord) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(record).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Presence, peer_id, doc_id, 0, payload))
    }

    pub fn peer_joined(peer_id: Uuid, doc_id: &str, user: &UserInfo) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(user).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, peer_id, doc_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn leave(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::Leave, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a full-state payload (SyncStep1, SyncStep2, StateUpdate).
    pub fn document_state(&self) -> Result<DocumentState, ProtocolError> {
        match self.msg_type {
            MessageType::SyncStep1 | MessageType::SyncStep2 | MessageType::StateUpdate => {
                decode_state(&self.payload)
            }
            _ => Err(ProtocolError::UnexpectedMessage),
        }
    }

    pub fn operation_payload(&self) -> Result<Operation, ProtocolError> {
        self.json_payload(MessageType::Operation)
    }

    pub fn presence_record(&self) -> Result<PresenceRecord, ProtocolError> {
        self.json_payload(MessageType::Presence)
    }

    pub fn user_info(&self) -> Result<UserInfo, ProtocolError> {
        self.json_payload(MessageType::PeerJoined)
    }

    fn json_payload<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedMessage);
        }
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

fn encode_state(state: &DocumentState) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(state).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_state(bytes: &[u8]) -> Result<DocumentState, ProtocolError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Unexpected message type")]
    UnexpectedMessage,
}
