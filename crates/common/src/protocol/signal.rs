// Relay signaling protocol: JSON envelopes exchanged between clients and the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The three handshake kinds the relay routes between peers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeKind {
    Offer,
    Answer,
    Candidate,
}

impl HandshakeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }

    /// Wrap a handshake body into the matching envelope variant.
    pub fn wrap(self, message: HandshakeMessage) -> SignalMessage {
        match self {
            Self::Offer => SignalMessage::Offer(message),
            Self::Answer => SignalMessage::Answer(message),
            Self::Candidate => SignalMessage::Candidate(message),
        }
    }
}

impl fmt::Display for HandshakeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an offer, answer or candidate frame.
///
/// Every field is optional on the wire so that malformed frames still decode
/// and can be rejected with a validation error instead of a parse error.
/// `payload` is an opaque session description or network candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Display name of the sender, injected by the relay when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
}

impl HandshakeMessage {
    pub fn new(payload: Value, sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self {
            payload: Some(payload),
            sender_id: Some(sender_id.into()),
            sender_name: None,
            receiver_id: Some(receiver_id.into()),
        }
    }

    /// Returns the receiver id when present and non-empty.
    pub fn receiver(&self) -> Option<&str> {
        self.receiver_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Returns the sender id when present and non-empty.
    pub fn sender(&self) -> Option<&str> {
        self.sender_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Returns the payload unless it is absent or JSON `null`.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref().filter(|value| !value.is_null())
    }
}

/// All frames of the relay signaling protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Client -> Relay: claim (or request) an identity.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    /// Relay -> Client: registration accepted under `user_id`.
    RegisterSuccess { user_id: String },

    /// Relay -> Client: ask the client for a display name.
    RequestUsername,

    /// Client -> Relay: set the display name (alias) for this client.
    SetUsername { username: String },

    /// Routed: session description offered by the initiator.
    Offer(HandshakeMessage),

    /// Routed: session description answering an offer.
    Answer(HandshakeMessage),

    /// Routed: network candidate.
    Candidate(HandshakeMessage),

    /// Relay -> Client: validation or delivery error.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl SignalMessage {
    /// Splits a routed frame into its kind and body.
    pub fn as_handshake(&self) -> Option<(HandshakeKind, &HandshakeMessage)> {
        match self {
            Self::Offer(message) => Some((HandshakeKind::Offer, message)),
            Self::Answer(message) => Some((HandshakeKind::Answer, message)),
            Self::Candidate(message) => Some((HandshakeKind::Candidate, message)),
            _ => None,
        }
    }

    pub fn into_handshake(self) -> Result<(HandshakeKind, HandshakeMessage), Self> {
        match self {
            Self::Offer(message) => Ok((HandshakeKind::Offer, message)),
            Self::Answer(message) => Ok((HandshakeKind::Answer, message)),
            Self::Candidate(message) => Ok((HandshakeKind::Candidate, message)),
            other => Err(other),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error { code: Some(code.to_string()), message: message.into() }
    }

    /// Frame name as it appears in the `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::RegisterSuccess { .. } => "registerSuccess",
            Self::RequestUsername => "requestUsername",
            Self::SetUsername { .. } => "setUsername",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::Error { .. } => "error",
        }
    }
}

pub fn decode_message(raw: &str) -> Result<SignalMessage, serde_json::Error> {
    serde_json::from_str::<SignalMessage>(raw)
}

pub fn encode_message(message: &SignalMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
