//! # Mission API Server
//!
//! Main entry point for the mission playbook control service.
//! Provides REST endpoints for mission management and runs the
//! WebSocket stream server, the metrics feed and retention pruning.

mod config;
mod error;
mod handlers;
mod routes;
mod state;

use crate::config::ApiConfig;
use crate::routes::create_router;
use crate::state::AppState;

use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("🛰️ Starting Mission Playbook Control v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = ApiConfig::load()?;
    info!("Configuration loaded");
    info!("   API Port: {}", config.api_port);
    info!("   WebSocket Port: {}", config.ws_port);
    info!("   Tick: {} ms", config.tick_interval_ms);
    info!("   Relay: {}", config.relay_url.as_deref().unwrap_or("disabled"));

    let state = AppState::new(config.clone())?;
    let shutdown = CancellationToken::new();

    let app = create_router(state.clone());
    info!("Routes configured");

    // WebSocket stream server
    let ws_hub = state.ws_hub.clone();
    let ws_port = config.ws_port;
    let ws_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = mission_websocket::start_server(ws_hub, ws_port, ws_shutdown).await {
            error!("WebSocket server error: {}", e);
        }
    });

    // Metrics fed from every mission's telemetry
    mission_telemetry::spawn_event_feed(
        state.metrics.clone(),
        state.registry.subscribe_all(),
        shutdown.clone(),
    );

    // Retention pruning
    tokio::spawn(prune_loop(state.clone(), shutdown.clone()));

    let addr = SocketAddr::new(config.host.parse()?, config.api_port);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🚀 API server listening on http://{}", addr);
    info!("WebSocket server on ws://{}:{}", config.host, config.ws_port);
    info!("Metrics available at http://{}/metrics", addr);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("🛑 Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,mission_api=debug,mission_engine=debug,mission_websocket=debug")
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Drop finished missions once their retention window has passed
async fn prune_loop(state: AppState, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(state.config.prune_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                for id in state.registry.prune_expired() {
                    state.metrics.forget_mission(id.as_str());
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, then cancel background tasks
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        }
    }
    shutdown.cancel();
}
