//! Application state management

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mission_engine::{MissionRegistry, SimulatedBackendFactory};
use mission_telemetry::MetricsCollector;
use mission_websocket::{MissionHub, WsUpstreamSinkFactory};
use tracing::info;

use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration
    pub config: ApiConfig,
    /// Every mission known to this server
    pub registry: Arc<MissionRegistry>,
    /// WebSocket hub for mission streams
    pub ws_hub: Arc<MissionHub>,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Create application state with all components
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let registry = build_registry(&config);
        info!(
            relay = config.relay_url.as_deref().unwrap_or("disabled"),
            "Mission registry initialized"
        );

        let ws_hub = Arc::new(MissionHub::new(registry.clone()));
        info!("WebSocket hub initialized");

        let metrics = Arc::new(MetricsCollector::new()?);

        Ok(Self {
            config,
            registry,
            ws_hub,
            metrics,
            started_at: Utc::now(),
        })
    }

    /// Get connected WebSocket client count
    pub fn ws_client_count(&self) -> usize {
        self.ws_hub.client_count()
    }

    /// Refresh gauges that are read from the registry rather than events
    pub fn refresh_metrics(&self) {
        self.metrics
            .set_missions_by_phase(self.registry.list_missions().into_iter().map(|m| m.phase));
        self.metrics.set_ws_connections(self.ws_client_count() as i64);
        self.metrics.sync_ws_sent(self.ws_hub.message_count() as u64);
    }
}

/// Registry backed by simulated vehicles, relaying upstream when configured.
///
/// The relay sink routes upstream decisions back into the registry, so it
/// holds a weak handle to the registry it belongs to.
fn build_registry(config: &ApiConfig) -> Arc<MissionRegistry> {
    let engine = config.engine();
    let backends = Arc::new(SimulatedBackendFactory::new());

    match &config.relay_url {
        Some(url) => Arc::new_cyclic(|weak| {
            let sinks = WsUpstreamSinkFactory::new(url.clone()).with_registry(weak.clone());
            MissionRegistry::new(engine, backends).with_sinks(Arc::new(sinks))
        }),
        None => Arc::new(MissionRegistry::new(engine, backends)),
    }
}
