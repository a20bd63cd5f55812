//! Binary protocol for document session synchronization.
//!
//! Wire format (bincode 2 serde encoding, standard config):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ payload  │
//! │ varint   │ uuid      │ uuid     │ bytes    │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! `msg_type` is written as its variant index, not its `repr(u8)` value.
//! The payload is itself a bincode value whose type depends on `msg_type`.
//!
//! Handshake on every (re)connect:
//! ```text
//! client                                   server
//!   │── Join(presence) ─────────────────────►│
//!   │── SyncStep1(client summary) ──────────►│
//!   │◄──────── SyncStep2(missing ops, server summary)
//!   │── Operations(ops the server lacks) ───►│   client is now synced
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::{Operation, VersionSummary};
use crate::presence::PresenceBroadcast;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame on a link: who is joining
    Join = 1,
    /// Version summary from the client
    SyncStep1 = 2,
    /// Missing operations plus the server's summary
    SyncStep2 = 3,
    /// Incremental CRDT operations
    Operations = 4,
    /// Periodic presence announcement
    Presence = 5,
    /// A participant's link closed
    PeerLeft = 6,
    /// Session rejected by the server; do not retry
    Revoked = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Payload of [`MessageType::SyncStep2`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReply {
    pub operations: Vec<Operation>,
    pub summary: VersionSummary,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender replica (nil when sent by the server itself)
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            payload,
        }
    }

    pub fn join(peer_id: Uuid, doc_id: Uuid, presence: &PresenceBroadcast) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, peer_id, doc_id, encode_payload(presence)?))
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, summary: &VersionSummary) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SyncStep1, peer_id, doc_id, encode_payload(summary)?))
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, reply: &SyncReply) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SyncStep2, peer_id, doc_id, encode_payload(reply)?))
    }

    pub fn operations(peer_id: Uuid, doc_id: Uuid, ops: &[Operation]) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Operations, peer_id, doc_id, encode_payload(&ops)?))
    }

    pub fn presence(peer_id: Uuid, doc_id: Uuid, presence: &PresenceBroadcast) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Presence, peer_id, doc_id, encode_payload(presence)?))
    }

    /// Departure notice; `user_id` is the participant whose link closed.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid, user_id: Uuid) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerLeft, peer_id, doc_id, encode_payload(&user_id)?))
    }

    pub fn revoked(doc_id: Uuid, reason: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Revoked, Uuid::nil(), doc_id, encode_payload(&reason)?))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(())
    }

    pub fn summary(&self) -> Result<VersionSummary, ProtocolError> {
        self.expect(MessageType::SyncStep1)?;
        decode_payload(&self.payload)
    }

    pub fn sync_reply(&self) -> Result<SyncReply, ProtocolError> {
        self.expect(MessageType::SyncStep2)?;
        decode_payload(&self.payload)
    }

    pub fn operation_batch(&self) -> Result<Vec<Operation>, ProtocolError> {
        self.expect(MessageType::Operations)?;
        decode_payload(&self.payload)
    }

    /// Presence carried by `Join` and `Presence` frames.
    pub fn presence_info(&self) -> Result<PresenceBroadcast, ProtocolError> {
        match self.msg_type {
            MessageType::Join | MessageType::Presence => decode_payload(&self.payload),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }

    pub fn departed_user(&self) -> Result<Uuid, ProtocolError> {
        self.expect(MessageType::PeerLeft)?;
        decode_payload(&self.payload)
    }

    pub fn revoke_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Revoked)?;
        decode_payload(&self.payload)
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("{0} timed out")]
    Timeout(&'static str),
}
