//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real gateway on an ephemeral port, exercise its WebSocket
//! endpoint, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::reaper::reaper_loop;
use crate::server::ws::{ws_handler, GatewayState};

/// Everything needed to start a gateway server.
pub struct ServerConfig {
    pub state: Arc<GatewayState>,
    pub bind_address: SocketAddr,
    pub sweep_interval: Duration,
    pub idle_threshold: Duration,
    /// When `false` (e.g. in tests), the idle reaper is **not** spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    pub fn from_gateway_config(
        config: &GatewayConfig,
        state: Arc<GatewayState>,
    ) -> Result<Self, crate::config::ConfigError> {
        Ok(Self {
            state,
            bind_address: config.bind_addr()?,
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            idle_threshold: Duration::from_millis(config.idle_threshold_ms),
            spawn_background_tasks: true,
        })
    }

    /// Minimal config suitable for integration tests: `127.0.0.1:0`
    /// (OS-assigned port), no background tasks.
    pub fn for_testing(state: Arc<GatewayState>) -> Self {
        Self {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            sweep_interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(600),
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<GatewayState>,
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

    /// `ws://ip:port/ws` URL for the running server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Trigger graceful shutdown: stop background tasks, then await the
    /// server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("server task returned error: {}", e),
            Ok(Err(e)) => error!("server task panicked: {}", e),
            Err(_) => warn!("server task did not finish within 5s timeout"),
        }
    }
}

/// Bind the listener, mount the routes, and spawn the serve task (plus the
/// idle reaper when background tasks are enabled).
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(config.state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.spawn_background_tasks {
        tokio::spawn(reaper_loop(
            Arc::clone(&config.state.isolation),
            config.sweep_interval,
            config.idle_threshold,
            shutdown_rx.clone(),
        ));
    }

    let mut serve_shutdown = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await
    });

    info!(target: "ws", %local_addr, "gateway listening");
    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        state: config.state,
        server_task,
    })
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeMs": state.uptime_ms(),
        "activeSessions": state.sessions.len(),
        "activeDevices": state.isolation.active(),
    }))
}
