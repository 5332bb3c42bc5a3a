//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real gateway on an ephemeral port, drive its HTTP and WebSocket
//! endpoints, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::server::health::health_handler;
use crate::server::ws::{self, WsServerState};
use crate::services::DataEvent;

/// Everything needed to start the gateway.
pub struct ServerConfig {
    pub ws_state: Arc<WsServerState>,
    pub bind_address: SocketAddr,
    /// Upstream data events to fan out to subscribers.
    pub data_events: Option<mpsc::Receiver<DataEvent>>,
    /// When `false` (e.g. in tests) the idle sweep is not spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Binds to `127.0.0.1:0` with background tasks disabled.
    pub fn for_testing(ws_state: Arc<WsServerState>) -> Self {
        ServerConfig {
            ws_state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_events: None,
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    ws_state: Arc<WsServerState>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port/ws`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn ws_state(&self) -> &Arc<WsServerState> {
        &self.ws_state
    }

    /// Stop background tasks, then wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        // Brief grace period for in-flight operations
        tokio::time::sleep(Duration::from_millis(100)).await;

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(target: "gateway", "Server task returned error: {}", e),
            Ok(Err(e)) => error!(target: "gateway", "Server task panicked: {}", e),
            Err(_) => warn!(target: "gateway", "Server task did not finish within 5s timeout"),
        }
    }
}

/// Spawn the idle sweep.
pub fn spawn_background_tasks(ws_state: &Arc<WsServerState>, shutdown_rx: &watch::Receiver<bool>) {
    let config = ws_state.config();
    info!(
        target: "gateway",
        idle_timeout_secs = config.idle_timeout_secs,
        sweep_interval_secs = config.idle_sweep_interval_secs,
        "starting idle sweep"
    );
    ws::spawn_idle_sweep_task(ws_state.clone(), shutdown_rx.clone());
}

pub fn build_router(ws_state: Arc<WsServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .with_state(ws_state)
}

/// Start the gateway from a fully-assembled [`ServerConfig`].
pub async fn run_server_with_config(
    config: ServerConfig,
) -> Result<ServerHandle, Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = build_router(config.ws_state.clone());

    if config.spawn_background_tasks {
        spawn_background_tasks(&config.ws_state, &shutdown_rx);
    }
    if let Some(events) = config.data_events {
        ws::spawn_data_feed_task(config.ws_state.clone(), events, shutdown_rx.clone());
    }

    // Supports port 0 for ephemeral port assignment
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "gateway", addr = %local_addr, "listening");

    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        ws_state: config.ws_state,
        server_task,
    })
}
