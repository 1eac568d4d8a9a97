//! WebSocket upgrade and per-connection lifecycle.
//!
//! Viewers are output-only: anything they send is read and dropped. The read
//! loop exists to notice disconnects, which then go through the same
//! `unregister` path the broadcaster uses for failed writes. It also stops as
//! soon as the broadcaster evicts the connection, dropping the read half.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, Stream};
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, UpgradeError};
use crate::registry::{Connection, ConnectionRegistry};
use crate::state::AppState;

pub async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);

    // A bad upgrade only affects this request.
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = UpgradeError::Rejected(rejection.body_text());
            warn!(peer = ?peer, error = %err, "rejecting websocket request");
            return rejection.into_response();
        }
    };

    ws.write_buffer_size(state.config.write_buffer_size)
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(move |e: axum::Error| {
            let err = UpgradeError::from(e);
            warn!(peer = ?peer, error = %err, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: Option<SocketAddr>, state: AppState) {
    let (sink, stream) = socket.split();
    let conn = Arc::new(Connection::new(state.registry.next_id(), peer, sink));
    serve_connection(state.registry, conn, stream).await;
}

/// Register `conn`, then drain `inbound` until it ends, fails, or the
/// connection is evicted.
pub async fn serve_connection<S, R, E>(
    registry: ConnectionRegistry<S>,
    conn: Arc<Connection<S>>,
    mut inbound: R,
) where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let id = conn.id();
    let peer = conn.peer();
    let evicted = conn.closed();
    tokio::pin!(evicted);
    registry.register(conn);
    info!(conn = id, peer = ?peer, viewers = registry.len(), "viewer connected");

    let failure = loop {
        tokio::select! {
            _ = &mut evicted => {
                debug!(conn = id, "connection evicted, stopping read loop");
                break None;
            }
            item = inbound.next() => match item {
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Some(ConnectionError::Read(e.to_string())),
            },
        }
    };
    drop(inbound);

    if let Some(err) = &failure {
        debug!(conn = id, error = %err, "viewer read loop ended");
    }
    // No-op if the broadcaster already evicted it.
    registry.unregister(id).await;
    info!(conn = id, peer = ?peer, viewers = registry.len(), "viewer disconnected");
}
