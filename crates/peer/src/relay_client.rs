// Relay connection manager: signaling WebSocket client with reconnection.
//
// Registers with the relay, answers display-name requests and forwards
// routed handshake frames to the peer node. Reconnects with a fixed delay
// and re-registers under the id the relay confirmed; handshakes that were
// in flight are not resumed.
//
// Transport is abstracted via `SignalTransport` for testability.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use coedit_common::protocol::signal::{self, SignalMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::validate_relay_url;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters: a fixed delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), max_attempts: None }
    }
}

/// Identity presented to the relay on every (re)registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayIdentity {
    pub client_id: Option<String>,
    pub display_name: Option<String>,
}

// ── Transport trait ─────────────────────────────────────────────────

/// Abstraction over the signaling socket for testability.
pub trait SignalTransport: Send {
    fn connect(&mut self, url: &str) -> impl Future<Output = Result<()>> + Send;

    fn send(&mut self, message: &SignalMessage) -> impl Future<Output = Result<()>> + Send;

    /// Receive the next frame. Returns `None` on close.
    fn recv(&mut self) -> impl Future<Output = Result<Option<SignalMessage>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `SignalTransport` over tokio-tungstenite.
#[derive(Default)]
pub struct WsSignalTransport {
    socket: Option<ClientSocket>,
}

impl WsSignalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(&mut self) -> Result<&mut ClientSocket> {
        self.socket.as_mut().ok_or_else(|| anyhow!("signaling socket is not connected"))
    }
}

impl SignalTransport for WsSignalTransport {
    async fn connect(&mut self, url: &str) -> Result<()> {
        let (socket, _) =
            connect_async(url).await.with_context(|| format!("failed to connect to relay {url}"))?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, message: &SignalMessage) -> Result<()> {
        let encoded = signal::encode_message(message).context("failed to encode signal frame")?;
        self.socket()?
            .send(WsMessage::Text(encoded.into()))
            .await
            .context("failed to send signal frame")
    }

    async fn recv(&mut self) -> Result<Option<SignalMessage>> {
        loop {
            let Some(frame) = self.socket()?.next().await else {
                return Ok(None);
            };
            match frame.context("signaling socket read failed")? {
                WsMessage::Text(raw) => match signal::decode_message(raw.as_str()) {
                    Ok(message) => return Ok(Some(message)),
                    Err(error) => warn!(%error, "ignoring undecodable relay frame"),
                },
                WsMessage::Close(_) => return Ok(None),
                // Pings are answered by tungstenite on the next read.
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Connected,
}

/// Events emitted by the connection manager for the peer node.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Registered (or re-registered) under `client_id`.
    Registered { client_id: String },
    /// Routed offer, answer or candidate.
    Signal(SignalMessage),
    /// The relay wants a display name and none is configured.
    UsernameRequested,
    /// Error notification from the relay.
    Error { code: Option<String>, message: String },
    /// Connection lost; a reconnect follows unless attempts are exhausted.
    Disconnected { reason: String },
}

// ── Connection manager ──────────────────────────────────────────────

pub struct RelayConnectionManager<T: SignalTransport> {
    relay_url: String,
    identity: RelayIdentity,
    reconnect_policy: ReconnectPolicy,
    transport: T,
    state: ConnectionState,
    consecutive_failures: u32,
}

impl<T: SignalTransport> RelayConnectionManager<T> {
    pub fn new(relay_url: impl Into<String>, identity: RelayIdentity, transport: T) -> Self {
        Self {
            relay_url: relay_url.into(),
            identity,
            reconnect_policy: ReconnectPolicy::default(),
            transport,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.identity.client_id.as_deref()
    }

    /// Attempt to connect (or reconnect) and register.
    ///
    /// Returns `Registered` on success, `Disconnected` on a recoverable
    /// failure, and an error only for a relay URL that can never work.
    pub async fn connect(&mut self) -> Result<RelayEvent> {
        validate_relay_url(&self.relay_url).map_err(|error| anyhow!(error))?;
        self.state = ConnectionState::Connecting;

        if let Err(error) = self.transport.connect(&self.relay_url).await {
            return Ok(self.fail(format!("relay connection failed: {error:#}")));
        }

        self.state = ConnectionState::Registering;
        let register = SignalMessage::Register {
            user_id: self.identity.client_id.clone(),
            username: self.identity.display_name.clone(),
        };
        if let Err(error) = self.transport.send(&register).await {
            self.transport.close().await;
            return Ok(self.fail(format!("failed to send register: {error:#}")));
        }

        loop {
            match self.transport.recv().await {
                Ok(Some(SignalMessage::RegisterSuccess { user_id })) => {
                    info!(client_id = %user_id, "registered with relay");
                    self.identity.client_id = Some(user_id.clone());
                    self.state = ConnectionState::Connected;
                    self.consecutive_failures = 0;
                    return Ok(RelayEvent::Registered { client_id: user_id });
                }
                Ok(Some(SignalMessage::Error { code, message })) => {
                    self.transport.close().await;
                    return Ok(self.fail(format!(
                        "register rejected: {}: {message}",
                        code.as_deref().unwrap_or("UNKNOWN")
                    )));
                }
                Ok(Some(other)) => {
                    debug!(frame = other.type_name(), "ignoring frame before registerSuccess");
                }
                Ok(None) => {
                    return Ok(self.fail("connection closed during registration".to_string()));
                }
                Err(error) => {
                    self.transport.close().await;
                    return Ok(self.fail(format!("error during registration: {error:#}")));
                }
            }
        }
    }

    fn fail(&mut self, reason: String) -> RelayEvent {
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures += 1;
        warn!(reason = %reason, failures = self.consecutive_failures, "relay connection attempt failed");
        RelayEvent::Disconnected { reason }
    }

    pub async fn send(&mut self, message: &SignalMessage) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot send {}: relay not connected", message.type_name()));
        }
        self.transport.send(message).await
    }

    /// Process the next incoming frame. Returns `None` for frames handled
    /// internally.
    pub async fn recv_event(&mut self) -> Result<Option<RelayEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot receive: relay not connected"));
        }

        match self.transport.recv().await? {
            Some(message @ (SignalMessage::Offer(_)
            | SignalMessage::Answer(_)
            | SignalMessage::Candidate(_))) => Ok(Some(RelayEvent::Signal(message))),

            Some(SignalMessage::RequestUsername) => match self.identity.display_name.clone() {
                Some(username) => {
                    self.transport.send(&SignalMessage::SetUsername { username }).await?;
                    Ok(None)
                }
                None => Ok(Some(RelayEvent::UsernameRequested)),
            },

            Some(SignalMessage::RegisterSuccess { user_id }) => {
                self.identity.client_id = Some(user_id.clone());
                Ok(Some(RelayEvent::Registered { client_id: user_id }))
            }

            Some(SignalMessage::Error { code, message }) => {
                Ok(Some(RelayEvent::Error { code, message }))
            }

            Some(other) => {
                debug!(frame = other.type_name(), "ignoring unexpected relay frame");
                Ok(None)
            }

            None => {
                self.state = ConnectionState::Disconnected;
                Ok(Some(RelayEvent::Disconnected { reason: "connection closed by relay".into() }))
            }
        }
    }

    /// Sets the display name locally and on the relay when connected.
    pub async fn set_display_name(&mut self, username: String) -> Result<()> {
        self.identity.display_name = Some(username.clone());
        if self.state == ConnectionState::Connected {
            self.transport.send(&SignalMessage::SetUsername { username }).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.state = ConnectionState::Disconnected;
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_policy.interval
    }

    /// Whether another attempt is allowed under `max_attempts`.
    pub fn should_reconnect(&self) -> bool {
        self.reconnect_policy.max_attempts.map_or(true, |max| self.consecutive_failures < max)
    }

    /// Drives the connection until shutdown, the outbox closes or reconnect
    /// attempts are exhausted.
    ///
    /// Frames from `outbox` are sent while connected and dropped with a
    /// warning otherwise; every event is converted and forwarded to `events`.
    pub async fn run<E>(
        mut self,
        mut outbox: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::UnboundedSender<E>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()>
    where
        E: From<RelayEvent> + Send,
    {
        loop {
            let event = self.connect().await?;
            let connected = matches!(event, RelayEvent::Registered { .. });
            if events.send(event.into()).is_err() {
                self.disconnect().await;
                return Ok(());
            }

            if connected {
                loop {
                    tokio::select! {
                        outgoing = outbox.recv() => {
                            let Some(message) = outgoing else {
                                self.disconnect().await;
                                return Ok(());
                            };
                            if let Err(error) = self.send(&message).await {
                                let reason = format!("send failed: {error:#}");
                                self.state = ConnectionState::Disconnected;
                                let _ = events.send(RelayEvent::Disconnected { reason }.into());
                                break;
                            }
                        }
                        incoming = self.recv_event() => {
                            match incoming {
                                Ok(Some(event @ RelayEvent::Disconnected { .. })) => {
                                    let _ = events.send(event.into());
                                    break;
                                }
                                Ok(Some(event)) => {
                                    if events.send(event.into()).is_err() {
                                        self.disconnect().await;
                                        return Ok(());
                                    }
                                }
                                Ok(None) => {}
                                Err(error) => {
                                    self.transport.close().await;
                                    self.state = ConnectionState::Disconnected;
                                    let reason = format!("{error:#}");
                                    let _ = events.send(RelayEvent::Disconnected { reason }.into());
                                    break;
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            self.disconnect().await;
                            return Ok(());
                        }
                    }
                }
            }

            if !self.should_reconnect() {
                return Err(anyhow!(
                    "giving up on relay after {} consecutive failures",
                    self.consecutive_failures
                ));
            }

            let delay = self.reconnect_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to relay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return Ok(()),
            }
            while let Ok(dropped) = outbox.try_recv() {
                warn!(frame = dropped.type_name(), "dropping signal frame queued while disconnected");
            }
        }
    }
}
