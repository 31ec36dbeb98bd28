// Periodic liveness sweep over registered clients.
//
// A client is evicted when the ping sent by the previous sweep is still
// unanswered, i.e. after one full interval without a pong.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::ClientRegistry;

pub struct LivenessHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl LivenessHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LivenessHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts the sweep loop on the current runtime.
pub fn spawn(registry: ClientRegistry, interval: Duration) -> LivenessHandle {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(run(registry, interval, shutdown_rx));
    info!(interval_ms = interval.as_millis() as u64, "liveness monitor started");
    LivenessHandle { shutdown_tx, task: Some(task) }
}

async fn run(registry: ClientRegistry, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.sweep(Instant::now().into_std()).await;
                debug!(
                    pinged = report.pinged,
                    evicted = report.evicted.len(),
                    expired_pending = report.expired_pending,
                    "liveness sweep"
                );
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("liveness monitor stopped");
}
