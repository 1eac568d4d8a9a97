//! Fan-out of snapshots to every registered viewer.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::Sink;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::registry::ConnectionRegistry;
use crate::types::Snapshot;

/// Outcome of one broadcast round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundReport {
    pub delivered: usize,
    pub evicted: usize,
}

pub struct Broadcaster<S> {
    registry: ConnectionRegistry<S>,
    send_timeout: Duration,
}

impl<S> Broadcaster<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(registry: ConnectionRegistry<S>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Consume snapshots until the channel closes, one full round per snapshot.
    pub async fn run(self, mut rx: mpsc::Receiver<Snapshot>) {
        let mut round: u64 = 0;
        while let Some(snapshot) = rx.recv().await {
            round += 1;
            let report = self.broadcast(&snapshot).await;
            debug!(
                round,
                delivered = report.delivered,
                evicted = report.evicted,
                "broadcast round done"
            );
        }
        info!("distribution channel closed, broadcaster stopping");
    }

    /// Send `snapshot` to every current member.
    ///
    /// The payload is serialized once and the same text goes to everyone. A
    /// member whose write fails is unregistered and skipped; the round goes on.
    pub async fn broadcast(&self, snapshot: &Snapshot) -> RoundReport {
        let text = match serde_json::to_string(&snapshot.to_message()) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot");
                return RoundReport::default();
            }
        };
        self.broadcast_text(&text).await
    }

    async fn broadcast_text(&self, text: &str) -> RoundReport {
        let tally = Arc::new(Tally::default());
        let timeout = self.send_timeout;

        self.registry
            .for_each(|conn| {
                let registry = self.registry.clone();
                let tally = Arc::clone(&tally);
                let text = text.to_owned();
                async move {
                    match conn.send_text(text, timeout).await {
                        Ok(()) => {
                            tally.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(conn = conn.id(), peer = ?conn.peer(), error = %e, "evicting viewer");
                            if registry.unregister(conn.id()).await {
                                tally.evicted.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            })
            .await;

        RoundReport {
            delivered: tally.delivered.load(Ordering::Relaxed),
            evicted: tally.evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Tally {
    delivered: AtomicUsize,
    evicted: AtomicUsize,
}
