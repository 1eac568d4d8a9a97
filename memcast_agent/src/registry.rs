//! Live viewer connections.
//!
//! The registry is the only shared mutable state in the agent. Every insert,
//! removal and iteration goes through the single lock inside
//! [`ConnectionRegistry`]; the lock is never held across an `.await`.
//! Transports are closed outside the lock, after removal, so a slow close can
//! not stall a concurrent broadcast round.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::error::ConnectionError;

pub type ConnectionId = u64;

// Upper bound on sending the close frame; the viewer may already be gone.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of one viewer connection.
///
/// The read half stays with the lifecycle handler, which watches [`Connection::closed`]
/// to stop reading once the connection is evicted. Once closed a connection is
/// never registered again.
pub struct Connection<S> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    sink: AsyncMutex<S>,
    closed: AtomicBool,
    evicted: CancellationToken,
}

impl<S> Connection<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>, sink: S) -> Self {
        Self {
            id,
            peer,
            sink: AsyncMutex::new(sink),
            closed: AtomicBool::new(false),
            evicted: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been removed from its registry.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.evicted.clone().cancelled_owned()
    }

    /// Write one text frame. A write that takes longer than `timeout` counts as failed.
    pub async fn send_text(&self, text: String, timeout: Duration) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Send("connection already closed".into()));
        }
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(timeout, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Send(e.to_string())),
            Err(_) => Err(ConnectionError::SendTimeout(timeout)),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.evicted.cancel();
    }

    async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn = self.id, error = %e, "close on dead transport"),
            Err(_) => debug!(conn = self.id, "close timed out"),
        }
    }
}

struct Inner<S> {
    members: Mutex<HashMap<ConnectionId, Arc<Connection<S>>>>,
    next_id: AtomicU64,
    len_tx: watch::Sender<usize>,
}

/// Set of live connections. Cheap to clone; clones share the same set.
pub struct ConnectionRegistry<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ConnectionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for ConnectionRegistry<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionRegistry<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                members: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                len_tx,
            }),
        }
    }

    /// Allocate an identity for a new connection.
    pub fn next_id(&self) -> ConnectionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn members(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection<S>>>> {
        // A panic while holding the lock can't leave the map half-updated.
        self.inner
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_len(&self, len: usize) {
        self.inner.len_tx.send_replace(len);
    }

    /// Add `conn` to the live set. Registering a member twice is a no-op, and a
    /// connection that has already been closed is ignored.
    pub fn register(&self, conn: Arc<Connection<S>>) {
        let mut members = self.members();
        if conn.is_closed() {
            debug!(conn = conn.id, "refusing to register a closed connection");
            return;
        }
        members.entry(conn.id).or_insert(conn);
        self.publish_len(members.len());
    }

    /// Remove the connection and close its transport.
    ///
    /// Only the call that actually removes the member closes the transport and
    /// wakes the read loop waiting on [`Connection::closed`]. Every other call
    /// (concurrent or repeated) is a no-op returning `false`.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut members = self.members();
            let removed = members.remove(&id);
            if let Some(conn) = &removed {
                conn.mark_closed();
            }
            self.publish_len(members.len());
            removed
        };
        match removed {
            Some(conn) => {
                conn.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the membership.
    pub fn snapshot(&self) -> Vec<Arc<Connection<S>>> {
        self.members().values().cloned().collect()
    }

    /// Visit every member present when the call starts.
    ///
    /// The lock is released before `f` runs, so `f` may unregister the
    /// connection it is visiting. Members closed by someone else in the
    /// meantime are skipped.
    pub async fn for_each<F, Fut>(&self, mut f: F)
    where
        F: FnMut(Arc<Connection<S>>) -> Fut,
        Fut: Future<Output = ()>,
    {
        for conn in self.snapshot() {
            if conn.is_closed() {
                continue;
            }
            f(conn).await;
        }
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.members().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Membership count, updated on every change.
    pub fn watch_len(&self) -> watch::Receiver<usize> {
        self.inner.len_tx.subscribe()
    }
}
