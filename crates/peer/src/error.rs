use coedit_common::crdt::origin::OriginCodecError;
use thiserror::Error;

/// Failures surfaced by the peer session controller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid target `{0}`")]
    InvalidTarget(String),
    #[error("relay connection is unavailable")]
    RelayUnavailable,
    #[error("no direct channel to `{remote_id}` within the negotiation timeout")]
    ConnectionTimeout { remote_id: String },
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn transport(error: anyhow::Error) -> Self {
        Self::TransportFailure(format!("{error:#}"))
    }
}

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to decode state vector: {0}")]
    StateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to observe document updates: {0}")]
    Observe(String),
    #[error("failed to merge updates: {0}")]
    Merge(String),
    #[error(transparent)]
    Origin(#[from] OriginCodecError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A received frame could not be decoded or applied; a resync was requested.
    #[error("sync corruption: {0}")]
    Corruption(String),
    #[error("direct channel send failed: {0}")]
    ChannelSend(String),
    #[error(transparent)]
    Crdt(#[from] CrdtError),
}
