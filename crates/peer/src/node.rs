// Peer node: one event loop owning the session controller and, while the
// direct channel is open, the sync manager.
//
// Every input arrives as a typed `PeerEvent`; timers (negotiation deadline,
// debounce flush) are computed from state on each iteration, so tearing the
// state down cancels them.

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::crdt::CrdtDocument;
use crate::error::SessionError;
use crate::relay_client::RelayEvent;
use crate::session::{PeerSessionController, SessionUpdate};
use crate::sync::{DebounceConfig, SyncManager, SyncProgress};
use crate::transport::{PeerTransport, TransportEvent};

/// Inputs of the peer node.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Relay(RelayEvent),
    Transport(TransportEvent),
    /// Open a session with `remote_id` (client id or display name).
    Connect { remote_id: String },
    /// Close the current session; the node keeps running.
    Close,
    Shutdown,
}

impl From<RelayEvent> for PeerEvent {
    fn from(event: RelayEvent) -> Self {
        Self::Relay(event)
    }
}

impl From<TransportEvent> for PeerEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

/// What the node reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotification {
    Registered { client_id: String },
    UsernameRequested,
    RelayError { code: Option<String>, message: String },
    RelayDisconnected { reason: String },
    SessionFailed(SessionError),
    NegotiationRestarted,
    Connected { remote_id: String },
    /// Initial state exchange finished on both sides of our Step 1.
    Synced,
    /// Remote changes were applied to the local document.
    RemoteChange,
    SessionClosed { error: Option<SessionError> },
}

pub struct PeerNode<T: PeerTransport, D: CrdtDocument + Clone> {
    session: PeerSessionController<T>,
    doc: D,
    debounce: DebounceConfig,
    sync: Option<SyncManager<D, T::Channel>>,
    local_updates: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    notifications: mpsc::UnboundedSender<PeerNotification>,
}

impl<T: PeerTransport, D: CrdtDocument + Clone> PeerNode<T, D> {
    pub fn new(
        session: PeerSessionController<T>,
        doc: D,
        debounce: DebounceConfig,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        notifications: mpsc::UnboundedSender<PeerNotification>,
    ) -> Self {
        Self { session, doc, debounce, sync: None, local_updates: None, events, notifications }
    }

    pub fn session(&self) -> &PeerSessionController<T> {
        &self.session
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.as_ref().is_some_and(SyncManager::is_active)
    }

    /// Earliest of the negotiation deadline and the debounce flush.
    pub fn next_deadline(&self) -> Option<Instant> {
        let flush = self.sync.as_ref().and_then(SyncManager::next_deadline);
        match (self.session.negotiation_deadline(), flush) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs until `Shutdown`, a broadcast on `shutdown_rx`, or the event
    /// channel closing.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.handle_event(event, Instant::now()) {
                        break;
                    }
                }
                Some(update) = next_local_update(&mut self.local_updates) => {
                    if let Some(sync) = self.sync.as_mut() {
                        sync.on_local_update_at(update, Instant::now());
                    }
                }
                _ = sleep_until(deadline) => {
                    self.on_deadline(Instant::now());
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Applies one event. Returns `false` once the node should stop.
    pub fn handle_event(&mut self, event: PeerEvent, now: Instant) -> bool {
        match event {
            PeerEvent::Relay(event) => self.on_relay_event(event, now),
            PeerEvent::Transport(event) => self.on_transport_event(event, now),
            PeerEvent::Connect { remote_id } => {
                if let Err(error) = self.session.initiate(&remote_id, now) {
                    warn!(%error, remote_id = %remote_id, "cannot start session");
                    self.notify(PeerNotification::SessionFailed(error));
                }
            }
            PeerEvent::Close => {
                self.stop_sync();
                self.session.close();
                self.notify(PeerNotification::SessionClosed { error: None });
            }
            PeerEvent::Shutdown => return false,
        }
        true
    }

    /// Fires whatever timers are due at `now`.
    pub fn on_deadline(&mut self, now: Instant) {
        if let Some(update) = self.session.check_timeout(now) {
            self.on_session_update(update);
        }
        if let Some(sync) = self.sync.as_mut() {
            if let Err(error) = sync.flush_due_at(now) {
                warn!(%error, "failed to flush local updates");
            }
        }
    }

    /// Synchronously stops every timer and subscription.
    pub fn shutdown(&mut self) {
        self.stop_sync();
        self.session.close();
        debug!("peer node stopped");
    }

    fn on_relay_event(&mut self, event: RelayEvent, now: Instant) {
        match event {
            RelayEvent::Registered { client_id } => {
                self.session.on_registered(&client_id);
                self.notify(PeerNotification::Registered { client_id });
            }
            RelayEvent::Signal(message) => match self.session.handle_signal(message, now) {
                Ok(Some(update)) => self.on_session_update(update),
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "handshake frame failed");
                    self.notify(PeerNotification::SessionFailed(error));
                }
            },
            RelayEvent::UsernameRequested => self.notify(PeerNotification::UsernameRequested),
            RelayEvent::Error { code, message } => {
                warn!(code = code.as_deref().unwrap_or(""), relay_message = %message, "relay reported an error");
                self.notify(PeerNotification::RelayError { code, message });
            }
            RelayEvent::Disconnected { reason } => {
                self.session.on_relay_disconnected();
                self.notify(PeerNotification::RelayDisconnected { reason });
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::StateChanged(state) => {
                if let Some(update) = self.session.on_transport_state(state, now) {
                    self.on_session_update(update);
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(error) = self.session.on_local_candidate(candidate) {
                    warn!(%error, "failed to forward local candidate");
                }
            }
            TransportEvent::ChannelOpen => self.start_sync(),
            TransportEvent::ChannelMessage(raw) => {
                let Some(sync) = self.sync.as_mut() else {
                    debug!("dropping direct frame without an active sync");
                    return;
                };
                let was_ready = sync.is_ready();
                match sync.handle_frame(&raw) {
                    Ok(SyncProgress::Applied) => {
                        let ready = sync.is_ready();
                        if ready && !was_ready {
                            self.notify(PeerNotification::Synced);
                        }
                        self.notify(PeerNotification::RemoteChange);
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "failed to handle direct frame"),
                }
            }
            TransportEvent::ChannelClosed => {
                self.stop_sync();
                if self.session.is_connected() {
                    self.session.close();
                    self.notify(PeerNotification::SessionClosed { error: None });
                }
            }
        }
    }

    fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Connected => {
                let remote_id = self.session.remote_id().unwrap_or_default().to_string();
                self.notify(PeerNotification::Connected { remote_id });
            }
            SessionUpdate::Restarted => self.notify(PeerNotification::NegotiationRestarted),
            SessionUpdate::Closed { error } => {
                self.stop_sync();
                self.notify(PeerNotification::SessionClosed { error });
            }
        }
    }

    fn start_sync(&mut self) {
        if self.is_syncing() {
            return;
        }
        let (Some(channel), Some(remote_id)) = (self.session.data_channel(), self.session.remote_id())
        else {
            warn!("channel opened without a bound session");
            return;
        };
        let mut sync = SyncManager::new(self.doc.clone(), channel, remote_id, self.debounce);
        match sync.start() {
            Ok(updates) => {
                info!(remote_id, "direct channel open, syncing");
                self.local_updates = Some(updates);
                self.sync = Some(sync);
            }
            Err(error) => warn!(%error, "failed to start sync"),
        }
    }

    fn stop_sync(&mut self) {
        if let Some(mut sync) = self.sync.take() {
            sync.teardown();
        }
        self.local_updates = None;
    }

    fn notify(&self, notification: PeerNotification) {
        if self.notifications.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

async fn next_local_update(updates: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
