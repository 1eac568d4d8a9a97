//! Registry and broadcaster behaviour under concurrent churn, using in-memory
//! channels in place of sockets.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::{Local, TimeZone};
use futures::channel::mpsc;
use futures::StreamExt;
use memcast_agent::broadcast::Broadcaster;
use memcast_agent::registry::{Connection, ConnectionId, ConnectionRegistry};
use memcast_agent::types::Snapshot;
use memcast_agent::ws::serve_connection;
use tokio::task::JoinHandle;

type Sink = mpsc::Sender<Message>;
type Inbound = mpsc::UnboundedSender<Result<Message, String>>;

const SEND_TIMEOUT: Duration = Duration::from_millis(200);

fn snapshot(used: u64, second: u32) -> Snapshot {
    let at = Local
        .with_ymd_and_hms(2026, 5, 1, 12, 0, second)
        .single()
        .expect("local time");
    Snapshot::from_bytes(100, used, 100 - used, at)
}

fn text(msg: Message) -> String {
    match msg {
        Message::Text(t) => t,
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Viewer driven through the real lifecycle handler.
struct Viewer {
    id: ConnectionId,
    inbound: Option<Inbound>,
    outbound: Option<mpsc::Receiver<Message>>,
    task: JoinHandle<()>,
}

fn spawn_viewer(registry: &ConnectionRegistry<Sink>, capacity: usize) -> Viewer {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::unbounded();
    let conn = Arc::new(Connection::new(registry.next_id(), None, out_tx));
    let id = conn.id();
    let task = tokio::spawn(serve_connection(registry.clone(), conn, in_rx));
    Viewer {
        id,
        inbound: Some(in_tx),
        outbound: Some(out_rx),
        task,
    }
}

/// Plain registered connection without a read loop.
fn register_direct(registry: &ConnectionRegistry<Sink>) -> (ConnectionId, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(16);
    let conn = Arc::new(Connection::new(registry.next_id(), None, tx));
    let id = conn.id();
    registry.register(conn);
    (id, rx)
}

async fn wait_for_len(registry: &ConnectionRegistry<Sink>, n: usize) {
    let mut rx = registry.watch_len();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|len| *len == n))
        .await
        .expect("registry reached expected size")
        .expect("watch open");
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Fate {
    Stays,
    Disconnects,
    FailsSend,
}

// Small deterministic shuffle so failures are reproducible.
fn shuffle<T>(items: &mut [T], mut seed: u64) {
    for i in (1..items.len()).rev() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_after_churn_is_exactly_the_survivors() {
    const N: usize = 48;
    const M: usize = 20;

    for seed in [7u64, 1234, 99_991] {
        let registry: ConnectionRegistry<Sink> = ConnectionRegistry::new();
        let mut viewers: Vec<(Fate, Viewer)> = (0..N)
            .map(|i| {
                let fate = match i % 3 {
                    0 => Fate::Stays,
                    1 => Fate::Disconnects,
                    _ => Fate::FailsSend,
                };
                // Room for every round so healthy viewers never block.
                (fate, spawn_viewer(&registry, M + 4))
            })
            .collect();
        wait_for_len(&registry, N).await;

        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), SEND_TIMEOUT));
        let rounds = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for round in 0..M {
                    broadcaster.broadcast(&snapshot(round as u64, 0)).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut order: Vec<usize> = (0..N).collect();
        shuffle(&mut order, seed);
        for idx in order {
            let (fate, viewer) = &mut viewers[idx];
            match fate {
                Fate::Stays => {}
                Fate::Disconnects => drop(viewer.inbound.take()),
                Fate::FailsSend => drop(viewer.outbound.take()),
            }
            tokio::task::yield_now().await;
        }

        rounds.await.expect("broadcast rounds");
        // One more round after every failure is in place.
        broadcaster.broadcast(&snapshot(99, 0)).await;

        let mut expected = BTreeSet::new();
        for (fate, viewer) in viewers.iter_mut() {
            match fate {
                Fate::Stays => {
                    expected.insert(viewer.id);
                }
                Fate::Disconnects => {
                    (&mut viewer.task).await.expect("handler finished");
                }
                Fate::FailsSend => {
                    // Evicted by the broadcaster; its read loop must stop even
                    // though the inbound side is still open.
                    tokio::time::timeout(Duration::from_secs(3), &mut viewer.task)
                        .await
                        .expect("evicted handler finished")
                        .expect("handler finished");
                }
            }
        }

        let actual: BTreeSet<_> = registry.ids().into_iter().collect();
        assert_eq!(actual, expected, "seed {seed}");

        for (_, viewer) in viewers {
            viewer.task.abort();
        }
    }
}

#[tokio::test]
async fn one_round_is_byte_identical_for_every_viewer() {
    let registry = ConnectionRegistry::new();
    let mut receivers: Vec<_> = (0..5).map(|_| register_direct(&registry).1).collect();

    let report = Broadcaster::new(registry.clone(), SEND_TIMEOUT)
        .broadcast(&snapshot(42, 7))
        .await;
    assert_eq!(report.delivered, 5);

    let payloads: Vec<String> = receivers
        .iter_mut()
        .map(|rx| text(rx.try_next().unwrap().unwrap()))
        .collect();
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    assert!(payloads[0].contains("\"PercentageUsedMemory\":\"42.00\""));
}

#[tokio::test]
async fn closed_viewer_is_dropped_without_hurting_others() {
    let registry = ConnectionRegistry::new();
    let (a, mut rx_a) = register_direct(&registry);
    let (b, rx_b) = register_direct(&registry);
    let (c, mut rx_c) = register_direct(&registry);
    drop(rx_b);

    let report = Broadcaster::new(registry.clone(), SEND_TIMEOUT)
        .broadcast(&snapshot(10, 1))
        .await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.evicted, 1);
    assert!(rx_a.try_next().unwrap().is_some());
    assert!(rx_c.try_next().unwrap().is_some());
    assert_eq!(registry.ids(), vec![a, c]);
    assert!(!registry.contains(b));
}

#[tokio::test]
async fn snapshots_arrive_in_sampling_order() {
    let registry = ConnectionRegistry::new();
    let (_, rx) = register_direct(&registry);

    let (tx, snaps) = tokio::sync::mpsc::channel(2);
    let run = tokio::spawn(Broadcaster::new(registry.clone(), SEND_TIMEOUT).run(snaps));
    for second in 1..=6 {
        tx.send(snapshot(second as u64 * 10, second)).await.unwrap();
    }
    drop(tx);
    run.await.unwrap();

    let times: Vec<String> = rx
        .take(6)
        .map(|m| {
            let js: serde_json::Value = serde_json::from_str(&text(m)).unwrap();
            js["Time"].as_str().unwrap().to_string()
        })
        .collect()
        .await;
    let expected: Vec<String> = (1..=6).map(|s| format!("01-05-2026 12:00:{s:02}")).collect();
    assert_eq!(times, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_unregister_closes_once() {
    let registry = ConnectionRegistry::new();
    let (id, mut rx) = register_direct(&registry);

    let r1 = registry.clone();
    let r2 = registry.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { r1.unregister(id).await }),
        tokio::spawn(async move { r2.unregister(id).await }),
    );
    let removed = [first.unwrap(), second.unwrap()];
    assert_eq!(removed.iter().filter(|r| **r).count(), 1);
    assert!(registry.is_empty());
    assert!(rx.next().await.is_none());
    assert!(!registry.unregister(id).await);
}
