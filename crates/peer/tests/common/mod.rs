// In-memory direct transport for integration tests.
//
// Two `LoopbackTransport`s share a hub. Each side gathers two candidates when
// it creates its description; once both sides hold the remote description and
// at least two remote candidates, the hub opens a channel that forwards text
// frames to the other side's event queue.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use coedit_peer::{PeerEvent, PeerNotification, PeerTransport, TransportEvent, TransportState};
use coedit_relay::RelayConfig;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const CANDIDATES_PER_SIDE: usize = 2;

struct Side {
    name: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    remote_description: bool,
    remote_candidates: usize,
    channel: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Default)]
struct Hub {
    sides: Vec<Side>,
    open: bool,
}

impl Hub {
    fn emit(&self, side: usize, event: TransportEvent) {
        let _ = self.sides[side].events.send(event.into());
    }

    fn gather(&self, side: usize) {
        for index in 0..CANDIDATES_PER_SIDE {
            let candidate = json!({ "candidate": format!("{}-{index}", self.sides[side].name) });
            self.emit(side, TransportEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_open(&mut self) {
        let ready = self
            .sides
            .iter()
            .all(|side| side.remote_description && side.remote_candidates >= CANDIDATES_PER_SIDE);
        if self.open || !ready {
            return;
        }
        self.open = true;

        for index in 0..self.sides.len() {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let peer_events = self.sides[1 - index].events.clone();
            tokio::spawn(async move {
                while let Some(raw) = rx.recv().await {
                    if peer_events.send(TransportEvent::ChannelMessage(raw).into()).is_err() {
                        break;
                    }
                }
                let _ = peer_events.send(TransportEvent::ChannelClosed.into());
            });
            self.sides[index].channel = Some(tx);
        }
        for index in 0..self.sides.len() {
            self.emit(index, TransportEvent::StateChanged(TransportState::Connected));
            self.emit(index, TransportEvent::ChannelOpen);
        }
    }
}

pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
    side: usize,
}

impl LoopbackTransport {
    fn with_hub<R>(&self, f: impl FnOnce(&mut Hub) -> R) -> Result<R> {
        let mut hub = self.hub.lock().map_err(|_| anyhow!("loopback hub poisoned"))?;
        Ok(f(&mut hub))
    }
}

/// Two connected transports delivering their events to the given queues.
pub fn loopback_pair(
    a: (&str, mpsc::UnboundedSender<PeerEvent>),
    b: (&str, mpsc::UnboundedSender<PeerEvent>),
) -> (LoopbackTransport, LoopbackTransport) {
    let side = |(name, events): (&str, mpsc::UnboundedSender<PeerEvent>)| Side {
        name: name.to_string(),
        events,
        remote_description: false,
        remote_candidates: 0,
        channel: None,
    };
    let hub = Arc::new(Mutex::new(Hub { sides: vec![side(a), side(b)], open: false }));
    (LoopbackTransport { hub: hub.clone(), side: 0 }, LoopbackTransport { hub, side: 1 })
}

impl PeerTransport for LoopbackTransport {
    type Channel = mpsc::UnboundedSender<String>;

    fn create_offer(&mut self) -> Result<Value> {
        let side = self.side;
        self.with_hub(|hub| {
            hub.gather(side);
            json!({ "type": "offer", "from": hub.sides[side].name })
        })
    }

    fn create_answer(&mut self, _offer: &Value) -> Result<Value> {
        let side = self.side;
        self.with_hub(|hub| {
            hub.sides[side].remote_description = true;
            hub.gather(side);
            hub.maybe_open();
            json!({ "type": "answer", "from": hub.sides[side].name })
        })
    }

    fn apply_answer(&mut self, _answer: &Value) -> Result<()> {
        let side = self.side;
        self.with_hub(|hub| {
            hub.sides[side].remote_description = true;
            hub.maybe_open();
        })
    }

    fn add_remote_candidate(&mut self, _candidate: &Value) -> Result<()> {
        let side = self.side;
        self.with_hub(|hub| {
            hub.sides[side].remote_candidates += 1;
            hub.maybe_open();
        })
    }

    fn restart_negotiation(&mut self) -> Result<Option<Value>> {
        Ok(None)
    }

    fn close(&mut self) {
        let side = self.side;
        let _ = self.with_hub(|hub| hub.sides[side].channel = None);
    }

    fn data_channel(&self) -> Option<Self::Channel> {
        self.hub.lock().ok().and_then(|hub| hub.sides[self.side].channel.clone())
    }
}

pub fn quiet_relay_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.request_username = false;
    config
}

pub async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    tokio::spawn(async move {
        coedit_relay::serve(listener, config, std::future::pending()).await.expect("relay should run");
    });
    addr
}

/// Waits for the first notification matching `predicate`, skipping others.
pub async fn wait_for(
    notes: &mut mpsc::UnboundedReceiver<PeerNotification>,
    predicate: impl Fn(&PeerNotification) -> bool,
) -> PeerNotification {
    loop {
        let note = tokio::time::timeout(Duration::from_secs(5), notes.recv())
            .await
            .expect("timed out waiting for peer notification")
            .expect("peer node should still be running");
        if predicate(&note) {
            return note;
        }
    }
}
