use super::protocol as ws_protocol;
use super::protocol::MAX_FRAME_BYTES;
use super::SignalingState;
use crate::error::{ErrorCode, RelayError};
use crate::registry::{ConnectionHandle, ConnectionId, Outbound};
use crate::router::{RouteOutcome, SenderContext};
use axum::{
    extract::{
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use coedit_common::protocol::signal::SignalMessage;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

pub async fn ws_upgrade(
    State(state): State<SignalingState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-socket view: the outbound handle and the client id once registered.
struct ConnectionContext {
    handle: ConnectionHandle,
    client_id: Option<String>,
}

impl ConnectionContext {
    fn sender(&self) -> SenderContext {
        SenderContext { client_id: self.client_id.clone(), connection_id: self.handle.id() }
    }

    fn reply_error(&self, error: &RelayError) {
        self.handle.push_signal(error.to_signal());
    }
}

async fn handle_socket(state: SignalingState, mut socket: WebSocket) {
    let connection_id = state.registry.next_connection_id();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = ConnectionContext {
        handle: ConnectionHandle::new(connection_id, outbound_sender),
        client_id: None,
    };
    debug!(connection_id, "signaling socket opened");
    let registration_deadline = Instant::now() + state.registration_timeout;

    loop {
        tokio::select! {
            _ = sleep_until(registration_deadline), if connection.client_id.is_none() => {
                info!(connection_id, "closing socket that never registered");
                ws_protocol::send_close(&mut socket, close_code::POLICY, "registration timeout".to_string())
                    .await;
                break;
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Signal(message)) => {
                        if let Err(error) = ws_protocol::send_signal(&mut socket, &message).await {
                            log_transport_failure(connection_id, &error);
                            break;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if let Err(error) =
                            ws_protocol::send_raw(&mut socket, Message::Ping(Vec::new().into())).await
                        {
                            log_transport_failure(connection_id, &error);
                            break;
                        }
                    }
                    Some(Outbound::Close { reason }) => {
                        ws_protocol::send_close(&mut socket, close_code::POLICY, reason).await;
                        break;
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            ws_protocol::close_frame_too_large(&mut socket).await;
                            break;
                        }
                        match ws_protocol::decode_message(&raw_message) {
                            Ok(inbound) => handle_inbound(&state, &mut connection, inbound).await,
                            Err(error) => {
                                debug!(connection_id, error = %error, "undecodable signaling frame");
                                connection.reply_error(&RelayError::from_code(ErrorCode::InvalidMessage));
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        connection.reply_error(&RelayError::with_code(
                            ErrorCode::InvalidMessage,
                            "binary frames are not supported",
                        ));
                    }
                    Ok(Message::Pong(_)) => {
                        if let Some(client_id) = &connection.client_id {
                            state.registry.record_pong(client_id, connection_id).await;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if let Err(error) = ws_protocol::send_raw(&mut socket, Message::Pong(payload)).await {
                            log_transport_failure(connection_id, &error);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) if ws_protocol::is_frame_size_violation(&error) => {
                        ws_protocol::close_frame_too_large(&mut socket).await;
                        break;
                    }
                    Err(error) => {
                        log_transport_failure(connection_id, &RelayError::TransportFailure(error.to_string()));
                        break;
                    }
                }
            }
        }
    }

    if let Some(client_id) = &connection.client_id {
        state.registry.unregister(client_id, connection_id).await;
    }
    debug!(connection_id, "signaling socket closed");
}

fn log_transport_failure(connection_id: ConnectionId, error: &RelayError) {
    debug!(connection_id, code = error.code().as_str(), error = %error, "signaling socket failed");
}

async fn handle_inbound(
    state: &SignalingState,
    connection: &mut ConnectionContext,
    inbound: SignalMessage,
) {
    match inbound {
        SignalMessage::Register { user_id, username } => {
            let requested = user_id.filter(|id| !id.trim().is_empty());
            if let Some(previous) = connection.client_id.take() {
                if requested.as_deref() != Some(previous.as_str()) {
                    state.registry.unregister(&previous, connection.handle.id()).await;
                }
            }
            let outcome = state
                .registry
                .register(requested, username, connection.handle.clone(), state.request_username)
                .await;
            if let Some(error) = &outcome.alias_error {
                connection.reply_error(error);
            }
            connection.client_id = Some(outcome.client_id);
        }
        SignalMessage::SetUsername { username } => {
            let Some(client_id) = &connection.client_id else {
                connection.reply_error(&RelayError::from_code(ErrorCode::RegistrationRequired));
                return;
            };
            if let Err(error) =
                state.registry.set_username(client_id, connection.handle.id(), &username).await
            {
                connection.reply_error(&error);
            }
        }
        message @ (SignalMessage::Offer(_) | SignalMessage::Answer(_) | SignalMessage::Candidate(_)) => {
            match state.router.route(&connection.sender(), message).await {
                Ok(RouteOutcome::Queued { kind, receiver, dropped }) if dropped > 0 => {
                    connection.reply_error(&RelayError::TargetNotFound {
                        receiver,
                        message: format!(
                            "{kind} queued but pending queue is full; {dropped} older message(s) dropped"
                        ),
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        connection_id = connection.handle.id(),
                        code = error.code().as_str(),
                        error = %error,
                        "rejected signaling frame"
                    );
                    connection.reply_error(&error);
                }
            }
        }
        other => {
            info!(
                connection_id = connection.handle.id(),
                frame = other.type_name(),
                "client sent relay-only frame"
            );
            connection.reply_error(&RelayError::with_code(
                ErrorCode::UnsupportedMessage,
                format!("`{}` frames are not accepted from clients", other.type_name()),
            ));
        }
    }
}
