use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use coedit_common::protocol::signal::{self, SignalMessage};

use crate::error::{ErrorCode, RelayError};

/// Upper bound for a single inbound text frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub fn decode_message(raw: &str) -> Result<SignalMessage, serde_json::Error> {
    signal::decode_message(raw)
}

pub async fn send_signal(socket: &mut WebSocket, message: &SignalMessage) -> Result<(), RelayError> {
    let encoded = signal::encode_message(message).map_err(|error| {
        RelayError::with_code(
            ErrorCode::InternalError,
            format!("failed to encode `{}` frame: {error}", message.type_name()),
        )
    })?;
    send_raw(socket, Message::Text(encoded.into())).await
}

pub async fn send_raw(socket: &mut WebSocket, message: Message) -> Result<(), RelayError> {
    socket.send(message).await.map_err(|error| RelayError::TransportFailure(error.to_string()))
}

pub async fn send_close(socket: &mut WebSocket, code: u16, reason: String) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

pub async fn close_frame_too_large(socket: &mut WebSocket) {
    send_close(
        socket,
        close_code::SIZE,
        format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes"),
    )
    .await;
}

pub fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
