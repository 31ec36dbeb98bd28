// Peer session controller: drives one direct-channel negotiation through the
// relay and owns the answer to "is the channel connected".
//
// Timing is explicit: every operation that can arm or check the negotiation
// deadline takes `now`, and the owner polls `check_timeout`.

use std::time::Duration;

use coedit_common::protocol::signal::{HandshakeKind, HandshakeMessage, SignalMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::transport::{PeerTransport, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    AwaitingAnswer,
    OfferReceived,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Outcome of a state-affecting event, for the owner to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Negotiation was restarted after a timeout or transport failure.
    Restarted,
    /// The transport reports the direct channel as connected.
    Connected,
    /// The session ended; `error` is set when it ended abnormally.
    Closed { error: Option<SessionError> },
}

pub struct PeerSessionController<T: PeerTransport> {
    local_id: String,
    transport: T,
    outbox: mpsc::UnboundedSender<SignalMessage>,
    relay_connected: bool,
    state: SessionState,
    role: Option<Role>,
    remote_id: Option<String>,
    pending_local_candidates: Vec<Value>,
    /// Candidates received before they could be applied, with their sender.
    pending_remote_candidates: Vec<(String, Value)>,
    remote_description_set: bool,
    negotiation_timeout: Duration,
    negotiation_deadline: Option<Instant>,
    restart_attempted: bool,
}

impl<T: PeerTransport> PeerSessionController<T> {
    pub fn new(
        local_id: impl Into<String>,
        transport: T,
        outbox: mpsc::UnboundedSender<SignalMessage>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            transport,
            outbox,
            relay_connected: false,
            state: SessionState::Idle,
            role: None,
            remote_id: None,
            pending_local_candidates: Vec::new(),
            pending_remote_candidates: Vec::new(),
            remote_description_set: false,
            negotiation_timeout,
            negotiation_deadline: None,
            restart_attempted: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn negotiation_deadline(&self) -> Option<Instant> {
        self.negotiation_deadline
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn pending_local_candidates(&self) -> usize {
        self.pending_local_candidates.len()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn data_channel(&self) -> Option<T::Channel> {
        self.transport.data_channel()
    }

    /// The relay confirmed (or assigned) our id.
    pub fn on_registered(&mut self, client_id: &str) {
        self.local_id = client_id.to_string();
        self.relay_connected = true;
        self.flush_local_candidates();
    }

    pub fn on_relay_disconnected(&mut self) {
        self.relay_connected = false;
    }

    /// Starts a session towards `remote_id` as the initiator.
    pub fn initiate(&mut self, remote_id: &str, now: Instant) -> Result<(), SessionError> {
        let remote_id = remote_id.trim();
        if remote_id.is_empty() || remote_id == self.local_id {
            return Err(SessionError::InvalidTarget(remote_id.to_string()));
        }
        if !self.relay_connected {
            return Err(SessionError::RelayUnavailable);
        }
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => return Err(SessionError::Closed),
            state => {
                return Err(SessionError::InvalidTarget(format!(
                    "{remote_id} (session already {state:?})"
                )));
            }
        }

        self.role = Some(Role::Initiator);
        self.bind_remote(remote_id);
        self.state = SessionState::Offering;
        self.arm_deadline(now);

        let offer = self.transport.create_offer().map_err(SessionError::transport)?;
        self.send_handshake(HandshakeKind::Offer, offer)?;
        self.state = SessionState::AwaitingAnswer;
        self.flush_local_candidates();
        info!(local_id = %self.local_id, remote_id, "offer sent");
        Ok(())
    }

    /// Routes a relay frame to the matching handler.
    pub fn handle_signal(
        &mut self,
        message: SignalMessage,
        now: Instant,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        match message.into_handshake() {
            Ok((HandshakeKind::Offer, body)) => self.on_offer(body, now).map(|()| None),
            Ok((HandshakeKind::Answer, body)) => self.on_answer(body).map(|()| None),
            Ok((HandshakeKind::Candidate, body)) => self.on_remote_candidate(body).map(|()| None),
            Err(other) => {
                debug!(frame = other.type_name(), "session ignores non-handshake frame");
                Ok(None)
            }
        }
    }

    pub fn on_offer(&mut self, message: HandshakeMessage, now: Instant) -> Result<(), SessionError> {
        let (Some(sender), Some(offer)) = (message.sender(), message.payload()) else {
            warn!("ignoring offer without sender or payload");
            return Ok(());
        };
        let sender = sender.to_string();

        let renegotiation = self.remote_id.as_deref() == Some(sender.as_str());
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => {
                warn!(sender = %sender, "ignoring offer on closed session");
                return Ok(());
            }
            _ if renegotiation => {
                debug!(sender = %sender, "renegotiation offer from bound remote");
            }
            state => {
                warn!(sender = %sender, ?state, "ignoring offer while negotiating with another peer");
                return Ok(());
            }
        }

        // A connected session answers renegotiation in place: the channel
        // stays up and no negotiation deadline applies.
        let connected = self.state == SessionState::Connected;
        if !renegotiation {
            self.role = Some(Role::Responder);
            self.bind_remote(&sender);
        }
        if !connected {
            self.state = SessionState::OfferReceived;
            if self.negotiation_deadline.is_none() {
                self.arm_deadline(now);
            }
        }

        let answer = self.transport.create_answer(offer).map_err(SessionError::transport)?;
        self.remote_description_set = true;
        if !connected {
            self.state = SessionState::Answering;
        }
        self.send_handshake(HandshakeKind::Answer, answer)?;
        self.flush_local_candidates();
        self.apply_pending_remote_candidates();
        info!(local_id = %self.local_id, remote_id = %sender, "answer sent");
        Ok(())
    }

    pub fn on_answer(&mut self, message: HandshakeMessage) -> Result<(), SessionError> {
        let awaiting = self.state == SessionState::AwaitingAnswer && !self.remote_description_set;
        if !awaiting || !self.accept_from_remote(&message) {
            warn!(
                sender = message.sender().unwrap_or(""),
                state = ?self.state,
                "ignoring unexpected answer"
            );
            return Ok(());
        }
        let Some(answer) = message.payload() else {
            warn!("ignoring answer without payload");
            return Ok(());
        };

        self.transport.apply_answer(answer).map_err(SessionError::transport)?;
        self.remote_description_set = true;
        self.apply_pending_remote_candidates();
        debug!(remote_id = message.sender().unwrap_or(""), "answer applied");
        Ok(())
    }

    pub fn on_remote_candidate(&mut self, message: HandshakeMessage) -> Result<(), SessionError> {
        let (Some(sender), Some(candidate)) = (message.sender(), message.payload()) else {
            warn!("ignoring candidate without sender or payload");
            return Ok(());
        };

        let bound = self.accept_from_remote(&message);
        if bound && self.remote_description_set && self.state != SessionState::Closed {
            self.transport.add_remote_candidate(candidate).map_err(SessionError::transport)?;
        } else {
            debug!(sender, bound, "queueing remote candidate");
            self.pending_remote_candidates.push((sender.to_string(), candidate.clone()));
        }
        Ok(())
    }

    /// A candidate gathered by the local transport.
    pub fn on_local_candidate(&mut self, candidate: Value) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.relay_connected && self.remote_id.is_some() {
            self.send_handshake(HandshakeKind::Candidate, candidate)
        } else {
            self.pending_local_candidates.push(candidate);
            Ok(())
        }
    }

    /// Connection state reported by the transport. Only `Connected` here
    /// moves the session to `Connected`.
    pub fn on_transport_state(
        &mut self,
        state: TransportState,
        now: Instant,
    ) -> Option<SessionUpdate> {
        if self.state == SessionState::Closed {
            return None;
        }
        match state {
            TransportState::Connected => {
                if self.state == SessionState::Connected {
                    return None;
                }
                self.state = SessionState::Connected;
                self.negotiation_deadline = None;
                info!(remote_id = self.remote_id.as_deref().unwrap_or(""), "direct channel connected");
                Some(SessionUpdate::Connected)
            }
            TransportState::Failed => {
                warn!(remote_id = self.remote_id.as_deref().unwrap_or(""), "transport failed");
                let error = SessionError::TransportFailure("transport reported failure".into());
                Some(self.restart_or_close(now, error))
            }
            TransportState::Closed => {
                self.close();
                Some(SessionUpdate::Closed { error: None })
            }
            TransportState::New | TransportState::Connecting | TransportState::Disconnected => None,
        }
    }

    /// Checks the negotiation deadline.
    pub fn check_timeout(&mut self, now: Instant) -> Option<SessionUpdate> {
        let deadline = self.negotiation_deadline?;
        if now < deadline || self.state == SessionState::Closed {
            return None;
        }
        let remote_id = self.remote_id.clone().unwrap_or_default();
        warn!(remote_id = %remote_id, restart_attempted = self.restart_attempted, "negotiation timed out");
        Some(self.restart_or_close(now, SessionError::ConnectionTimeout { remote_id }))
    }

    fn restart_or_close(&mut self, now: Instant, error: SessionError) -> SessionUpdate {
        if self.restart_attempted {
            self.close();
            return SessionUpdate::Closed { error: Some(error) };
        }
        self.restart_attempted = true;
        self.arm_deadline(now);

        match self.transport.restart_negotiation() {
            Ok(Some(offer)) => {
                self.remote_description_set = false;
                if let Err(error) = self.send_handshake(HandshakeKind::Offer, offer) {
                    self.close();
                    return SessionUpdate::Closed { error: Some(error) };
                }
                self.state = SessionState::AwaitingAnswer;
            }
            Ok(None) => {}
            Err(error) => {
                self.close();
                return SessionUpdate::Closed { error: Some(SessionError::transport(error)) };
            }
        }
        info!(remote_id = self.remote_id.as_deref().unwrap_or(""), "negotiation restarted");
        SessionUpdate::Restarted
    }

    /// Closes the transport and drops all queued state. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transport.close();
        self.pending_local_candidates.clear();
        self.pending_remote_candidates.clear();
        self.negotiation_deadline = None;
        self.state = SessionState::Closed;
        info!(remote_id = self.remote_id.as_deref().unwrap_or(""), "session closed");
    }

    /// Whether `message` comes from the bound remote, by id or by display
    /// name. A match by name rebinds the session to the sender's id.
    fn accept_from_remote(&mut self, message: &HandshakeMessage) -> bool {
        let Some(sender) = message.sender() else {
            return false;
        };
        match self.remote_id.as_deref() {
            Some(remote) if remote == sender => true,
            Some(remote) if message.sender_name.as_deref() == Some(remote) => {
                debug!(alias = remote, client_id = sender, "remote resolved by display name");
                self.remote_id = Some(sender.to_string());
                true
            }
            _ => false,
        }
    }

    fn bind_remote(&mut self, remote_id: &str) {
        self.remote_id = Some(remote_id.to_string());
        self.pending_remote_candidates.retain(|(sender, _)| sender == remote_id);
    }

    fn arm_deadline(&mut self, now: Instant) {
        self.negotiation_deadline = Some(now + self.negotiation_timeout);
    }

    fn flush_local_candidates(&mut self) {
        if !self.relay_connected || self.remote_id.is_none() {
            return;
        }
        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            if let Err(error) = self.send_handshake(HandshakeKind::Candidate, candidate) {
                warn!(%error, "failed to flush local candidate");
            }
        }
    }

    fn apply_pending_remote_candidates(&mut self) {
        let Some(remote_id) = self.remote_id.clone() else {
            return;
        };
        for (sender, candidate) in std::mem::take(&mut self.pending_remote_candidates) {
            if sender != remote_id {
                continue;
            }
            if let Err(error) = self.transport.add_remote_candidate(&candidate) {
                warn!(error = %format!("{error:#}"), "failed to apply queued candidate");
            }
        }
    }

    fn send_handshake(&mut self, kind: HandshakeKind, payload: Value) -> Result<(), SessionError> {
        let Some(remote_id) = self.remote_id.clone() else {
            return Err(SessionError::InvalidTarget(String::new()));
        };
        let message = kind.wrap(HandshakeMessage::new(payload, self.local_id.clone(), remote_id));
        self.outbox.send(message).map_err(|_| SessionError::RelayUnavailable)
    }
}
