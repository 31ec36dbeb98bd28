// Direct peer transport abstraction.
//
// The session controller drives negotiation through `PeerTransport`; the
// transport reports back asynchronously through `TransportEvent`s delivered
// to the peer node's event channel.

use anyhow::{anyhow, Result};
use coedit_common::protocol::peer::{encode_message, PeerMessage};
use serde_json::Value;
use tokio::sync::mpsc;

/// Connection state reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// Network candidate gathered locally; must reach the remote via the relay.
    LocalCandidate(Value),
    ChannelOpen,
    /// Raw text frame received on the direct channel.
    ChannelMessage(String),
    ChannelClosed,
}

/// Ordered, reliable message channel to the remote peer.
pub trait DataChannel {
    fn send(&self, message: &PeerMessage) -> Result<()>;
}

impl DataChannel for mpsc::UnboundedSender<String> {
    fn send(&self, message: &PeerMessage) -> Result<()> {
        let encoded = encode_message(message)?;
        mpsc::UnboundedSender::send(self, encoded).map_err(|_| anyhow!("direct channel is closed"))
    }
}

/// Negotiation surface of a direct peer-to-peer transport.
///
/// Session descriptions and candidates are opaque JSON values; only the
/// transport interprets them.
pub trait PeerTransport {
    type Channel: DataChannel;

    /// Local offer; the transport begins gathering candidates.
    fn create_offer(&mut self) -> Result<Value>;

    /// Applies the remote offer and returns the local answer.
    fn create_answer(&mut self, offer: &Value) -> Result<Value>;

    fn apply_answer(&mut self, answer: &Value) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<()>;

    /// Restarts candidate gathering. Returns a fresh offer when this side has
    /// to re-offer for the restart to take effect.
    fn restart_negotiation(&mut self) -> Result<Option<Value>>;

    fn close(&mut self);

    /// Handle to the data channel once it exists.
    fn data_channel(&self) -> Option<Self::Channel>;
}
