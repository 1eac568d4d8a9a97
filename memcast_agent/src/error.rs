//! Error types for the agent.
//!
//! Only `StartupError` is fatal. Everything else is contained at the tick or
//! connection boundary where it happens.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The OS memory query failed; the tick is skipped.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("memory statistics are not supported on this platform")]
    Unsupported,

    #[error("memory query reported no physical memory")]
    Empty,
}

/// An inbound request could not be promoted to a WebSocket.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade request rejected: {0}")]
    Rejected(String),

    #[error("upgrade handshake failed: {0}")]
    Handshake(#[from] axum::Error),
}

/// Failure on a single viewer connection; the connection is evicted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("send did not complete within {0:?}")]
    SendTimeout(Duration),

    #[error("read failed: {0}")]
    Read(String),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed for {path}: {reason}")]
    Tls { path: PathBuf, reason: String },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}
