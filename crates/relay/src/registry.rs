// Client registry: live sessions, display-name aliases and pending handshake
// queues for offline receivers.
//
// All three maps sit behind one lock so that resolution, delivery and queue
// flushes observe a consistent view. Delivery only pushes onto the owning
// connection's outbound channel; socket writes happen in the connection task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use coedit_common::protocol::signal::SignalMessage;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};

pub type ConnectionId = u64;

/// Instruction for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Signal(SignalMessage),
    Ping,
    Close { reason: String },
}

/// Sending half of one socket connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `false` once the writer task has gone away.
    pub fn push(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }

    pub fn push_signal(&self, message: SignalMessage) -> bool {
        self.push(Outbound::Signal(message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    pub max_per_target: usize,
    pub max_targets: usize,
    pub ttl: Duration,
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self { max_per_target: 64, max_targets: 10_000, ttl: Duration::from_secs(300) }
    }
}

#[derive(Debug)]
struct ClientSession {
    connection: ConnectionHandle,
    display_name: Option<String>,
    registered_at: DateTime<Utc>,
    last_pong_at: DateTime<Utc>,
    awaiting_pong: bool,
}

#[derive(Debug)]
struct PendingMessage {
    message: SignalMessage,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<String, ClientSession>,
    aliases: HashMap<String, String>,
    pending: HashMap<String, VecDeque<PendingMessage>>,
}

impl RegistryInner {
    fn resolve(&self, key: &str) -> Option<String> {
        if self.sessions.contains_key(key) {
            return Some(key.to_string());
        }
        self.aliases.get(key).filter(|client_id| self.sessions.contains_key(*client_id)).cloned()
    }

    fn drop_alias_of(&mut self, client_id: &str) {
        if let Some(name) =
            self.sessions.get(client_id).and_then(|session| session.display_name.clone())
        {
            if self.aliases.get(&name).is_some_and(|owner| owner == client_id) {
                self.aliases.remove(&name);
            }
        }
    }

    fn remove_session(&mut self, client_id: &str) -> Option<ClientSession> {
        self.drop_alias_of(client_id);
        self.sessions.remove(client_id)
    }

    /// Moves everything queued under `key` onto the client's connection.
    fn flush(&mut self, key: &str, client_id: &str, now: Instant, ttl: Duration) -> usize {
        let Some(queue) = self.pending.remove(key) else {
            return 0;
        };
        let Some(session) = self.sessions.get(client_id) else {
            self.pending.insert(key.to_string(), queue);
            return 0;
        };

        let mut delivered = 0;
        let mut expired = 0;
        let mut remaining = VecDeque::new();
        let mut writer_gone = false;
        for pending in queue {
            if now.saturating_duration_since(pending.enqueued_at) >= ttl {
                expired += 1;
                continue;
            }
            if writer_gone || !session.connection.push_signal(pending.message.clone()) {
                writer_gone = true;
                remaining.push_back(pending);
                continue;
            }
            delivered += 1;
        }

        if expired > 0 {
            debug!(key, expired, "dropped expired pending messages during flush");
        }
        if !remaining.is_empty() {
            self.pending.insert(key.to_string(), remaining);
        }
        delivered
    }

    fn enqueue(
        &mut self,
        key: &str,
        message: SignalMessage,
        now: Instant,
        limits: &PendingLimits,
    ) -> usize {
        if !self.pending.contains_key(key) && self.pending.len() >= limits.max_targets {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, queue)| queue.front().map(|pending| pending.enqueued_at))
                .map(|(target, _)| target.clone());
            if let Some(oldest) = oldest {
                let evicted = self.pending.remove(&oldest).map_or(0, |queue| queue.len());
                warn!(target_key = %oldest, evicted, "pending target cap reached, evicting oldest queue");
            }
        }

        let queue = self.pending.entry(key.to_string()).or_default();
        let mut dropped = 0;
        while queue.len() >= limits.max_per_target {
            queue.pop_front();
            dropped += 1;
        }
        queue.push_back(PendingMessage { message, enqueued_at: now });
        if dropped > 0 {
            warn!(target_key = key, dropped, "pending queue full, dropped oldest message");
        }
        dropped
    }

    fn prune_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut pruned = 0;
        self.pending.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|pending| now.saturating_duration_since(pending.enqueued_at) < ttl);
            pruned += before - queue.len();
            !queue.is_empty()
        });
        pruned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub client_id: String,
    /// An older connection held this id and has been told to close.
    pub superseded: bool,
    pub flushed: usize,
    /// Set when the requested display name belongs to another client.
    pub alias_error: Option<RelayError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { client_id: String },
    Queued { key: String, dropped: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: Vec<String>,
    pub expired_pending: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub aliases: usize,
    pub pending_targets: usize,
    pub pending_messages: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub display_name: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_pong_at: DateTime<Utc>,
    pub awaiting_pong: bool,
}

/// Shared, cloneable handle to the registry.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    limits: PendingLimits,
    next_connection_id: Arc<AtomicU64>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(PendingLimits::default())
    }
}

impl ClientRegistry {
    /// Limits are clamped to at least one message, one target and one second.
    pub fn new(limits: PendingLimits) -> Self {
        let limits = PendingLimits {
            max_per_target: limits.max_per_target.max(1),
            max_targets: limits.max_targets.max(1),
            ttl: limits.ttl.max(Duration::from_secs(1)),
        };
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            limits,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn limits(&self) -> PendingLimits {
        self.limits
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers (or re-registers) a client on `connection`.
    ///
    /// Queues `registerSuccess`, then anything pending under the client id
    /// or its display name, then `requestUsername` when the client has no
    /// name and `request_username` is set.
    pub async fn register(
        &self,
        requested_id: Option<String>,
        username: Option<String>,
        connection: ConnectionHandle,
        request_username: bool,
    ) -> RegisterOutcome {
        self.register_at(requested_id, username, connection, request_username, Instant::now())
            .await
    }

    pub async fn register_at(
        &self,
        requested_id: Option<String>,
        username: Option<String>,
        connection: ConnectionHandle,
        request_username: bool,
        now: Instant,
    ) -> RegisterOutcome {
        let client_id = requested_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let username = username.map(|name| name.trim().to_string()).filter(|name| !name.is_empty());

        let mut inner = self.inner.write().await;

        let mut superseded = false;
        if let Some(previous) = inner.remove_session(&client_id) {
            if previous.connection.id() != connection.id() {
                superseded = true;
                previous.connection.push(Outbound::Close {
                    reason: "superseded by a newer connection".to_string(),
                });
                info!(client_id = %client_id, "registration superseded older connection");
            }
        }

        let mut alias_error = None;
        let display_name = match username {
            Some(name) => match inner.aliases.get(&name) {
                Some(owner) if owner != &client_id && inner.sessions.contains_key(owner) => {
                    alias_error = Some(RelayError::with_code(
                        ErrorCode::AliasConflict,
                        format!("display name `{name}` is already in use"),
                    ));
                    None
                }
                _ => Some(name),
            },
            None => None,
        };
        if let Some(name) = &display_name {
            inner.aliases.insert(name.clone(), client_id.clone());
        }

        let registered_at = Utc::now();
        inner.sessions.insert(
            client_id.clone(),
            ClientSession {
                connection: connection.clone(),
                display_name: display_name.clone(),
                registered_at,
                last_pong_at: registered_at,
                awaiting_pong: false,
            },
        );

        connection.push_signal(SignalMessage::RegisterSuccess { user_id: client_id.clone() });

        let ttl = self.limits.ttl;
        let mut flushed = inner.flush(&client_id, &client_id, now, ttl);
        if let Some(name) = &display_name {
            flushed += inner.flush(name, &client_id, now, ttl);
        }

        if display_name.is_none() && request_username {
            connection.push_signal(SignalMessage::RequestUsername);
        }

        info!(
            client_id = %client_id,
            connection_id = connection.id(),
            display_name = display_name.as_deref().unwrap_or(""),
            flushed,
            "client registered"
        );

        RegisterOutcome { client_id, superseded, flushed, alias_error }
    }

    /// Sets the display name of a registered client and flushes anything
    /// queued under that name.
    pub async fn set_username(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
        username: &str,
    ) -> Result<usize, RelayError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(RelayError::validation("username must not be empty"));
        }

        let mut inner = self.inner.write().await;
        match inner.sessions.get(client_id) {
            Some(session) if session.connection.id() == connection_id => {}
            _ => return Err(RelayError::from_code(ErrorCode::RegistrationRequired)),
        }
        if let Some(owner) = inner.aliases.get(username) {
            if owner != client_id && inner.sessions.contains_key(owner) {
                return Err(RelayError::with_code(
                    ErrorCode::AliasConflict,
                    format!("display name `{username}` is already in use"),
                ));
            }
        }

        inner.drop_alias_of(client_id);
        inner.aliases.insert(username.to_string(), client_id.to_string());
        if let Some(session) = inner.sessions.get_mut(client_id) {
            session.display_name = Some(username.to_string());
        }

        let flushed = inner.flush(username, client_id, Instant::now(), self.limits.ttl);
        info!(client_id, display_name = username, flushed, "display name set");
        Ok(flushed)
    }

    /// Removes the session if it is still owned by `connection_id`.
    pub async fn unregister(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let owned = inner
            .sessions
            .get(client_id)
            .is_some_and(|session| session.connection.id() == connection_id);
        if owned {
            inner.remove_session(client_id);
            info!(client_id, connection_id, "client unregistered");
        }
        owned
    }

    pub async fn record_pong(&self, client_id: &str, connection_id: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(client_id) {
            if session.connection.id() == connection_id {
                session.awaiting_pong = false;
                session.last_pong_at = Utc::now();
            }
        }
    }

    /// Delivers `message` to the client `key` resolves to, or queues it under
    /// `key` when no live session matches.
    pub async fn dispatch(&self, key: &str, message: SignalMessage) -> DispatchOutcome {
        self.dispatch_at(key, message, Instant::now()).await
    }

    pub async fn dispatch_at(
        &self,
        key: &str,
        message: SignalMessage,
        now: Instant,
    ) -> DispatchOutcome {
        let mut inner = self.inner.write().await;

        if let Some(client_id) = inner.resolve(key) {
            let delivered = inner
                .sessions
                .get(&client_id)
                .is_some_and(|session| session.connection.push_signal(message.clone()));
            if delivered {
                return DispatchOutcome::Delivered { client_id };
            }
            warn!(client_id = %client_id, "writer for live session is gone, evicting");
            inner.remove_session(&client_id);
        }

        let dropped = inner.enqueue(key, message, now, &self.limits);
        DispatchOutcome::Queued { key: key.to_string(), dropped }
    }

    /// One liveness pass: evicts sessions still awaiting a pong from the
    /// previous pass, pings the rest and prunes expired pending messages.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut inner = self.inner.write().await;
        let mut report = SweepReport::default();

        let mut stale = Vec::new();
        for (client_id, session) in inner.sessions.iter_mut() {
            if session.awaiting_pong {
                stale.push((client_id.clone(), "heartbeat timeout"));
                continue;
            }
            if session.connection.push(Outbound::Ping) {
                session.awaiting_pong = true;
                report.pinged += 1;
            } else {
                stale.push((client_id.clone(), "writer closed"));
            }
        }

        for (client_id, reason) in stale {
            if let Some(session) = inner.remove_session(&client_id) {
                session.connection.push(Outbound::Close { reason: reason.to_string() });
                warn!(client_id = %client_id, reason, "evicted unresponsive client");
                report.evicted.push(client_id);
            }
        }

        report.expired_pending = inner.prune_expired(now, self.limits.ttl);
        report
    }

    pub async fn resolve(&self, key: &str) -> Option<String> {
        self.inner.read().await.resolve(key)
    }

    pub async fn is_live(&self, client_id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(client_id)
    }

    pub async fn display_name(&self, client_id: &str) -> Option<String> {
        self.inner.read().await.sessions.get(client_id).and_then(|s| s.display_name.clone())
    }

    /// Client id owning `connection_id` under `client_id`, if still current.
    pub async fn owns(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        self.inner
            .read()
            .await
            .sessions
            .get(client_id)
            .is_some_and(|session| session.connection.id() == connection_id)
    }

    pub async fn pending_len(&self, key: &str) -> usize {
        self.inner.read().await.pending.get(key).map_or(0, VecDeque::len)
    }

    pub async fn session(&self, client_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.read().await;
        inner.sessions.get(client_id).map(|session| SessionSnapshot {
            client_id: client_id.to_string(),
            display_name: session.display_name.clone(),
            registered_at: session.registered_at,
            last_pong_at: session.last_pong_at,
            awaiting_pong: session.awaiting_pong,
        })
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            sessions: inner.sessions.len(),
            aliases: inner.aliases.len(),
            pending_targets: inner.pending.len(),
            pending_messages: inner.pending.values().map(VecDeque::len).sum(),
        }
    }
}
