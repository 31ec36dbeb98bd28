// Direct-channel protocol: frames exchanged peer-to-peer once the channel is open.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames of the two-phase sync protocol plus incremental updates.
///
/// Binary CRDT payloads travel base64-encoded inside JSON text frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Sender's state vector; the receiver answers with `SyncStep2`.
    SyncStep1 { state_vector_b64: String },

    /// Everything the step-1 sender was missing.
    SyncStep2 { update_b64: String },

    /// Incremental (possibly coalesced) update.
    Update { update_b64: String },
}

impl PeerMessage {
    pub fn sync_step1(state_vector: &[u8]) -> Self {
        Self::SyncStep1 { state_vector_b64: STANDARD.encode(state_vector) }
    }

    pub fn sync_step2(update: &[u8]) -> Self {
        Self::SyncStep2 { update_b64: STANDARD.encode(update) }
    }

    pub fn update(update: &[u8]) -> Self {
        Self::Update { update_b64: STANDARD.encode(update) }
    }

    /// Decodes the binary payload carried by this frame.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, PayloadDecodeError> {
        let encoded = match self {
            Self::SyncStep1 { state_vector_b64 } => state_vector_b64,
            Self::SyncStep2 { update_b64 } | Self::Update { update_b64 } => update_b64,
        };
        STANDARD.decode(encoded).map_err(|error| PayloadDecodeError(error.to_string()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "sync_step1",
            Self::SyncStep2 { .. } => "sync_step2",
            Self::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid base64 payload: {0}")]
pub struct PayloadDecodeError(String);

pub fn decode_message(raw: &str) -> Result<PeerMessage, serde_json::Error> {
    serde_json::from_str::<PeerMessage>(raw)
}

pub fn encode_message(message: &PeerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
