use coedit_common::protocol::signal::SignalMessage;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    RegistrationRequired,
    AliasConflict,
    InvalidMessage,
    UnsupportedMessage,
    TargetNotFound,
    TransportFailure,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::RegistrationRequired => "REGISTRATION_REQUIRED",
            Self::AliasConflict => "ALIAS_CONFLICT",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::TransportFailure => "TRANSPORT_FAILURE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "message validation failed",
            Self::RegistrationRequired => "register before sending this message",
            Self::AliasConflict => "display name is already in use",
            Self::InvalidMessage => "invalid websocket frame payload",
            Self::UnsupportedMessage => "message type is not accepted from clients",
            Self::TargetNotFound => "receiver is offline",
            Self::TransportFailure => "connection transport failed",
            Self::InternalError => "internal relay error",
        }
    }
}

/// Errors surfaced by the relay core.
///
/// None of these are fatal to the relay: they are reported back to the
/// offending connection as an `error` frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("{message}")]
    Validation { code: ErrorCode, message: String },
    #[error("receiver `{receiver}` is offline: {message}")]
    TargetNotFound { receiver: String, message: String },
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { code: ErrorCode::ValidationFailed, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::Validation { code, message: code.default_message().to_string() }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Validation { code, message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. } => *code,
            Self::TargetNotFound { .. } => ErrorCode::TargetNotFound,
            Self::TransportFailure(_) => ErrorCode::TransportFailure,
        }
    }

    /// Error frame sent back to the client that caused the error.
    pub fn to_signal(&self) -> SignalMessage {
        SignalMessage::error(self.code().as_str(), self.to_string())
    }
}
