//! Binary protocol between board clients and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! One WebSocket connection carries exactly one room, so frames do not name
//! the room. Messages originated by the relay carry [`RELAY_PEER_ID`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Sender id used by the relay itself.
pub const RELAY_PEER_ID: Uuid = Uuid::nil();

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, opens the handshake
    SyncStep1 = 1,
    /// Yrs diff answering a state vector
    SyncStep2 = 2,
    /// Incremental Yrs update
    Delta = 3,
    /// Presence update or leave
    Awareness = 4,
    /// A peer's connection to the room closed
    PeerLeft = 5,
    /// Relay refused the connection; payload is the reason
    Rejected = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Per-sender counter, increases with every delta or awareness update
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            clock,
            payload,
        }
    }

    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, 0, diff)
    }

    pub fn delta(peer_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, clock, update)
    }

    pub fn awareness(
        peer_id: Uuid,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Awareness,
            peer_id,
            clock,
            message.encode()?,
        ))
    }

    pub fn peer_left(peer_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, 0, Vec::new())
    }

    pub fn rejected(reason: &str) -> Self {
        Self::new(
            MessageType::Rejected,
            RELAY_PEER_ID,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0, Vec::new())
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

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == expected {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            })
        }
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        AwarenessMessage::decode(&self.payload)
    }

    /// Human-readable rejection reason.
    pub fn rejection_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Rejected)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}
