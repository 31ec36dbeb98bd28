use coedit_common::protocol::signal::{HandshakeKind, HandshakeMessage, SignalMessage};
use tracing::{debug, info};

use crate::error::{ErrorCode, RelayError};
use crate::registry::{ClientRegistry, ConnectionId, DispatchOutcome};

/// Who sent a routed frame, as known by the connection that received it.
#[derive(Debug, Clone)]
pub struct SenderContext {
    pub client_id: Option<String>,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered { kind: HandshakeKind, receiver: String },
    Queued { kind: HandshakeKind, receiver: String, dropped: usize },
}

/// Validates offer/answer/candidate frames and hands them to the registry
/// for delivery. The payload is opaque and forwarded unchanged.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    registry: ClientRegistry,
}

impl MessageRouter {
    pub fn new(registry: ClientRegistry) -> Self {
        Self { registry }
    }

    pub async fn route(
        &self,
        sender: &SenderContext,
        message: SignalMessage,
    ) -> Result<RouteOutcome, RelayError> {
        let (kind, body) = message.into_handshake().map_err(|other| {
            RelayError::with_code(
                ErrorCode::UnsupportedMessage,
                format!("`{}` frames are not routed", other.type_name()),
            )
        })?;
        let receiver = validate(kind, &body)?.to_string();

        let registered = match &sender.client_id {
            Some(id) => self.registry.owns(id, sender.connection_id).await.then(|| id.clone()),
            None => None,
        };
        let (sender_id, sender_name) = match registered {
            Some(id) => {
                let name = self.registry.display_name(&id).await;
                (id, name)
            }
            None => {
                let Some(claimed) = body.sender().map(str::to_string) else {
                    return Err(RelayError::with_code(
                        ErrorCode::RegistrationRequired,
                        format!("register before sending {kind}"),
                    ));
                };
                // A live id belongs to the connection that registered it.
                if self.registry.is_live(&claimed).await {
                    return Err(RelayError::with_code(
                        ErrorCode::RegistrationRequired,
                        format!("`{claimed}` is registered on another connection"),
                    ));
                }
                (claimed, None)
            }
        };

        let forwarded = kind.wrap(HandshakeMessage {
            payload: body.payload,
            sender_id: Some(sender_id.clone()),
            sender_name,
            receiver_id: Some(receiver.clone()),
        });

        match self.registry.dispatch(&receiver, forwarded).await {
            DispatchOutcome::Delivered { client_id } => {
                debug!(kind = %kind, sender = %sender_id, receiver = %client_id, "routed handshake");
                Ok(RouteOutcome::Delivered { kind, receiver: client_id })
            }
            DispatchOutcome::Queued { key, dropped } => {
                info!(kind = %kind, sender = %sender_id, receiver = %key, "receiver offline, queued");
                Ok(RouteOutcome::Queued { kind, receiver: key, dropped })
            }
        }
    }
}

fn validate(kind: HandshakeKind, body: &HandshakeMessage) -> Result<&str, RelayError> {
    if body.payload().is_none() {
        return Err(RelayError::validation(format!("{kind} requires a non-null payload")));
    }
    body.receiver()
        .ok_or_else(|| RelayError::validation(format!("{kind} requires a receiverId")))
}
