//! Wiring: router, listener, sampler and broadcaster tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::config::{AgentConfig, MAX_CHANNEL_CAPACITY};
use crate::error::StartupError;
use crate::sampler::{spawn_sampler, MemorySource};
use crate::state::{AppState, ViewerRegistry};
use crate::tls;
use crate::ws::ws_handler;

type ServerTask = JoinHandle<std::io::Result<()>>;

/// Upgrade endpoint plus static assets as the fallback.
pub fn router(state: AppState) -> Router {
    let ws_path = state.config.ws_path.clone();
    let web_dir = state.config.web_dir.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .fallback_service(ServeDir::new(web_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A started agent. Dropping it leaves the tasks running; call
/// [`RunningAgent::wait`] or [`RunningAgent::shutdown`].
pub struct RunningAgent {
    local_addr: SocketAddr,
    registry: ViewerRegistry,
    server: ServerTask,
    sampler: JoinHandle<()>,
    broadcaster: JoinHandle<()>,
}

impl RunningAgent {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ViewerRegistry {
        &self.registry
    }

    /// Run until the HTTP server stops (Ctrl-C or a fatal I/O error).
    pub async fn wait(self) -> Result<(), StartupError> {
        let result = self.server.await;
        self.sampler.abort();
        self.broadcaster.abort();
        match result {
            Ok(served) => served.map_err(StartupError::Serve),
            Err(e) => Err(StartupError::Serve(std::io::Error::other(e))),
        }
    }

    pub fn shutdown(&self) {
        self.server.abort();
        self.sampler.abort();
        self.broadcaster.abort();
    }
}

/// Bind the listener and start every task. Binding happens first so a bad
/// address fails before anything is spawned.
pub async fn start<M: MemorySource>(
    config: AgentConfig,
    source: M,
) -> Result<RunningAgent, StartupError> {
    let config = Arc::new(config);
    let registry = ViewerRegistry::new();
    let app = router(AppState {
        registry: registry.clone(),
        config: Arc::clone(&config),
    });

    if !config.web_dir.is_dir() {
        warn!(dir = %config.web_dir.display(), "static asset directory not found");
    }

    let addr = config.listen_addr();
    let (server, local_addr) = if config.enable_tls {
        serve_tls(app, addr).await?
    } else {
        serve_plain(app, addr).await?
    };

    let (tx, rx) = mpsc::channel(config.channel_capacity.clamp(1, MAX_CHANNEL_CAPACITY));
    let viewers = config.pause_when_idle.then(|| registry.watch_len());
    let sampler = spawn_sampler(source, tx, viewers, config.sample_interval);
    let broadcaster = tokio::spawn(Broadcaster::new(registry.clone(), config.send_timeout).run(rx));

    let scheme = if config.enable_tls { "wss" } else { "ws" };
    info!(
        "memcast agent listening at {scheme}://{local_addr}{} (interval {:?})",
        config.ws_path, config.sample_interval
    );

    Ok(RunningAgent {
        local_addr,
        registry,
        server,
        sampler,
        broadcaster,
    })
}

async fn serve_plain(app: Router, addr: SocketAddr) -> Result<(ServerTask, SocketAddr), StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
    });
    Ok((server, local_addr))
}

async fn serve_tls(app: Router, addr: SocketAddr) -> Result<(ServerTask, SocketAddr), StartupError> {
    let (cert_path, key_path) = tls::ensure_self_signed_cert()?;
    let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .map_err(|e| StartupError::Tls {
            path: cert_path.clone(),
            reason: e.to_string(),
        })?;

    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| StartupError::Bind { addr, source })?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let handle = axum_server::Handle::new();
    let on_signal = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    let server = tokio::spawn(async move {
        axum_server::tls_rustls::from_tcp_rustls(listener, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
    });
    Ok((server, local_addr))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
