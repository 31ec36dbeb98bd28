// Synchronization manager: two-phase state exchange plus debounced streaming
// of local updates over an open direct channel.

use std::time::Duration;

use coedit_common::crdt::origin::UpdateOrigin;
use coedit_common::protocol::peer::{decode_message, PeerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crdt::CrdtDocument;
use crate::error::SyncError;
use crate::transport::DataChannel;

const MIN_WINDOW_MS: u64 = 10;
const MAX_WINDOW_MS: u64 = 1_000;

/// Coalescing window for outgoing updates.
///
/// The window restarts on every local update; `max_wait` caps how long the
/// oldest pending update can be held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    window: Duration,
    max_wait: Duration,
}

impl DebounceConfig {
    pub fn with_millis(window_ms: u64, max_wait_ms: u64) -> Self {
        let window_ms = window_ms.clamp(MIN_WINDOW_MS, MAX_WINDOW_MS);
        Self {
            window: Duration::from_millis(window_ms),
            max_wait: Duration::from_millis(max_wait_ms.max(window_ms)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::with_millis(50, 500)
    }
}

/// What handling one inbound frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    /// Answered a Sync Step 1 with our diff.
    Answered,
    /// Applied remote changes to the document.
    Applied,
    /// The frame was corrupt; Sync Step 1 was re-issued.
    Resynced,
    /// The manager is torn down.
    Ignored,
}

pub struct SyncManager<D: CrdtDocument, C: DataChannel> {
    doc: D,
    channel: Option<C>,
    remote_id: String,
    debounce: DebounceConfig,
    subscription: Option<D::Subscription>,
    pending: Vec<Vec<u8>>,
    first_pending_at: Option<Instant>,
    last_pending_at: Option<Instant>,
    ready: bool,
}

impl<D: CrdtDocument, C: DataChannel> SyncManager<D, C> {
    pub fn new(doc: D, channel: C, remote_id: impl Into<String>, debounce: DebounceConfig) -> Self {
        Self {
            doc,
            channel: Some(channel),
            remote_id: remote_id.into(),
            debounce,
            subscription: None,
            pending: Vec::new(),
            first_pending_at: None,
            last_pending_at: None,
            ready: false,
        }
    }

    /// Subscribes to local updates and sends Sync Step 1.
    ///
    /// The returned receiver yields every local update; feed them back through
    /// [`SyncManager::on_local_update_at`].
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscription = Some(self.doc.observe_local_updates(tx)?);
        self.send_step1()?;
        debug!(remote_id = %self.remote_id, "sync started");
        Ok(rx)
    }

    /// True once the remote answered our Sync Step 1.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn document(&self) -> &D {
        &self.doc
    }

    /// Handles a raw text frame from the direct channel.
    pub fn handle_frame(&mut self, raw: &str) -> Result<SyncProgress, SyncError> {
        if !self.is_active() {
            return Ok(SyncProgress::Ignored);
        }
        match decode_message(raw) {
            Ok(message) => self.handle_message(message),
            Err(error) => self.resync(SyncError::Corruption(format!("undecodable frame: {error}"))),
        }
    }

    pub fn handle_message(&mut self, message: PeerMessage) -> Result<SyncProgress, SyncError> {
        if !self.is_active() {
            return Ok(SyncProgress::Ignored);
        }
        let kind = message.type_name();
        let bytes = match message.payload_bytes() {
            Ok(bytes) => bytes,
            Err(error) => return self.resync(SyncError::Corruption(format!("{kind}: {error}"))),
        };

        match message {
            PeerMessage::SyncStep1 { .. } => match self.doc.encode_diff(&bytes) {
                Ok(diff) => {
                    self.send(&PeerMessage::sync_step2(&diff))?;
                    Ok(SyncProgress::Answered)
                }
                Err(error) => self.resync(SyncError::Corruption(format!("{kind}: {error}"))),
            },
            PeerMessage::SyncStep2 { .. } | PeerMessage::Update { .. } => {
                let origin = UpdateOrigin::remote(self.remote_id.clone());
                if let Err(error) = self.doc.apply_update(&bytes, &origin) {
                    return self.resync(SyncError::Corruption(format!("{kind}: {error}")));
                }
                if matches!(message, PeerMessage::SyncStep2 { .. }) && !self.ready {
                    self.ready = true;
                    debug!(remote_id = %self.remote_id, "initial sync complete");
                }
                Ok(SyncProgress::Applied)
            }
        }
    }

    /// Queues a local update for the next flush.
    pub fn on_local_update_at(&mut self, update: Vec<u8>, now: Instant) {
        if !self.is_active() {
            return;
        }
        self.pending.push(update);
        self.first_pending_at.get_or_insert(now);
        self.last_pending_at = Some(now);
    }

    /// When the pending batch must be sent, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        let first = self.first_pending_at?;
        let last = self.last_pending_at?;
        Some((last + self.debounce.window).min(first + self.debounce.max_wait))
    }

    /// Sends the pending batch when its deadline has passed. Returns whether a
    /// frame was sent.
    pub fn flush_due_at(&mut self, now: Instant) -> Result<bool, SyncError> {
        match self.next_deadline() {
            Some(deadline) if deadline <= now => self.flush(),
            _ => Ok(false),
        }
    }

    /// Sends the pending batch immediately, merged into one update.
    pub fn flush(&mut self) -> Result<bool, SyncError> {
        if self.pending.is_empty() || !self.is_active() {
            return Ok(false);
        }
        let updates = std::mem::take(&mut self.pending);
        self.first_pending_at = None;
        self.last_pending_at = None;

        let merged = if updates.len() == 1 {
            updates.into_iter().next().unwrap_or_default()
        } else {
            self.doc.merge_updates(&updates)?
        };
        self.send(&PeerMessage::update(&merged))?;
        Ok(true)
    }

    /// Drops the observer and any unsent updates. Later calls are no-ops.
    pub fn teardown(&mut self) {
        if self.channel.take().is_none() {
            return;
        }
        self.subscription = None;
        let discarded = self.pending.len();
        self.pending.clear();
        self.first_pending_at = None;
        self.last_pending_at = None;
        self.ready = false;
        debug!(remote_id = %self.remote_id, discarded, "sync torn down");
    }

    fn resync(&mut self, error: SyncError) -> Result<SyncProgress, SyncError> {
        warn!(remote_id = %self.remote_id, %error, "sync corruption, requesting full resync");
        self.send_step1()?;
        Ok(SyncProgress::Resynced)
    }

    fn send_step1(&mut self) -> Result<(), SyncError> {
        let state_vector = self.doc.encode_state_vector();
        self.send(&PeerMessage::sync_step1(&state_vector))
    }

    fn send(&self, message: &PeerMessage) -> Result<(), SyncError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        channel.send(message).map_err(|error| SyncError::ChannelSend(format!("{error:#}")))
    }
}
