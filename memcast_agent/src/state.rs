//! Shared agent state handed to the HTTP handlers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;

use crate::config::AgentConfig;
use crate::registry::ConnectionRegistry;

/// Outbound half of an upgraded viewer socket.
pub type WsSink = SplitSink<WebSocket, Message>;

pub type ViewerRegistry = ConnectionRegistry<WsSink>;

#[derive(Clone)]
pub struct AppState {
    pub registry: ViewerRegistry,
    pub config: Arc<AgentConfig>,
}
