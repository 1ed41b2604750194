//! # Mission Telemetry - Metrics & Observability
//!
//! Prometheus metrics for the mission control service.
//! Provides metrics for:
//! - Mission phases and outcomes
//! - Vehicle battery, speed and altitude per mission
//! - Approvals and contingency warnings
//! - WebSocket connections and API requests

use std::sync::Arc;

use mission_core::{MissionStatus, TelemetryEnvelope, TelemetryEvent, WarningLevel};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PHASES: [MissionStatus; 9] = [
    MissionStatus::Planned,
    MissionStatus::TakingOff,
    MissionStatus::EnRoute,
    MissionStatus::AwaitingApproval,
    MissionStatus::Returning,
    MissionStatus::Landing,
    MissionStatus::Completed,
    MissionStatus::Aborted,
    MissionStatus::Failed,
];

/// Metrics collector for the mission control service
pub struct MetricsCollector {
    registry: Registry,

    // Mission metrics
    missions_by_phase: IntGaugeVec,
    missions_finished: IntCounterVec,
    mission_battery: GaugeVec,
    mission_speed: GaugeVec,
    mission_altitude: GaugeVec,
    waypoints_reached: IntCounterVec,

    // Operator metrics
    approvals_requested: IntCounterVec,
    approvals_resolved: IntCounterVec,
    warnings_total: IntCounterVec,
    telemetry_events: IntCounterVec,

    // WebSocket metrics
    ws_connections: IntGauge,
    ws_messages_sent: IntCounter,

    // API metrics
    api_requests_total: IntCounterVec,
    api_request_duration: HistogramVec,
}

impl MetricsCollector {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let missions_by_phase = IntGaugeVec::new(
            Opts::new("mission_control_missions", "Missions currently in each phase"),
            &["phase"],
        )?;
        registry.register(Box::new(missions_by_phase.clone()))?;

        let missions_finished = IntCounterVec::new(
            Opts::new("mission_control_missions_finished_total", "Missions that reached a terminal phase"),
            &["status"],
        )?;
        registry.register(Box::new(missions_finished.clone()))?;

        let mission_battery = GaugeVec::new(
            Opts::new("mission_control_battery_percent", "Vehicle battery level"),
            &["mission_id"],
        )?;
        registry.register(Box::new(mission_battery.clone()))?;

        let mission_speed = GaugeVec::new(
            Opts::new("mission_control_speed_mps", "Vehicle ground speed"),
            &["mission_id"],
        )?;
        registry.register(Box::new(mission_speed.clone()))?;

        let mission_altitude = GaugeVec::new(
            Opts::new("mission_control_altitude_meters", "Vehicle altitude"),
            &["mission_id"],
        )?;
        registry.register(Box::new(mission_altitude.clone()))?;

        let waypoints_reached = IntCounterVec::new(
            Opts::new("mission_control_waypoints_reached_total", "Waypoints reached"),
            &["mission_id"],
        )?;
        registry.register(Box::new(waypoints_reached.clone()))?;

        let approvals_requested = IntCounterVec::new(
            Opts::new("mission_control_approvals_requested_total", "Approvals raised to operators"),
            &["kind"],
        )?;
        registry.register(Box::new(approvals_requested.clone()))?;

        let approvals_resolved = IntCounterVec::new(
            Opts::new("mission_control_approvals_resolved_total", "Approvals resolved"),
            &["decision"],
        )?;
        registry.register(Box::new(approvals_resolved.clone()))?;

        let warnings_total = IntCounterVec::new(
            Opts::new("mission_control_warnings_total", "Mission warnings"),
            &["level"],
        )?;
        registry.register(Box::new(warnings_total.clone()))?;

        let telemetry_events = IntCounterVec::new(
            Opts::new("mission_control_telemetry_events_total", "Telemetry events published"),
            &["type"],
        )?;
        registry.register(Box::new(telemetry_events.clone()))?;

        let ws_connections = IntGauge::new("mission_control_ws_connections", "Active WebSocket connections")?;
        registry.register(Box::new(ws_connections.clone()))?;

        let ws_messages_sent = IntCounter::new(
            "mission_control_ws_messages_sent_total",
            "Total WebSocket messages sent",
        )?;
        registry.register(Box::new(ws_messages_sent.clone()))?;

        let api_requests_total = IntCounterVec::new(
            Opts::new("mission_control_api_requests_total", "API requests"),
            &["method", "path", "status"],
        )?;
        registry.register(Box::new(api_requests_total.clone()))?;

        let api_request_duration = HistogramVec::new(
            HistogramOpts::new("mission_control_api_request_duration_seconds", "API request duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "path"],
        )?;
        registry.register(Box::new(api_request_duration.clone()))?;

        info!("📊 Metrics collector initialized");

        Ok(Self {
            registry,
            missions_by_phase,
            missions_finished,
            mission_battery,
            mission_speed,
            mission_altitude,
            waypoints_reached,
            approvals_requested,
            approvals_resolved,
            warnings_total,
            telemetry_events,
            ws_connections,
            ws_messages_sent,
            api_requests_total,
            api_request_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    // ========================================================================
    // MISSION METRICS
    // ========================================================================

    /// Replace the per-phase mission counts
    pub fn set_missions_by_phase(&self, phases: impl IntoIterator<Item = MissionStatus>) {
        let mut counts = [0i64; PHASES.len()];
        for phase in phases {
            if let Some(slot) = PHASES.iter().position(|p| *p == phase) {
                counts[slot] += 1;
            }
        }
        for (phase, count) in PHASES.iter().zip(counts) {
            self.missions_by_phase.with_label_values(&[&phase.to_string()]).set(count);
        }
    }

    /// Update counters and gauges from one telemetry envelope
    pub fn observe(&self, envelope: &TelemetryEnvelope) {
        let mission_id = envelope.mission_id.as_str();
        self.telemetry_events
            .with_label_values(&[envelope.event.kind()])
            .inc();

        match &envelope.event {
            TelemetryEvent::PositionUpdate {
                position,
                battery,
                speed,
                ..
            } => {
                self.mission_battery.with_label_values(&[mission_id]).set(*battery);
                self.mission_speed.with_label_values(&[mission_id]).set(*speed);
                self.mission_altitude
                    .with_label_values(&[mission_id])
                    .set(position.altitude);
            }
            TelemetryEvent::WaypointReached { .. } => {
                self.waypoints_reached.with_label_values(&[mission_id]).inc();
            }
            TelemetryEvent::ApprovalRequired { approval } => {
                self.approvals_requested
                    .with_label_values(&[&approval.kind.to_string()])
                    .inc();
            }
            TelemetryEvent::ApprovalResolved { decision, .. } => {
                self.approvals_resolved
                    .with_label_values(&[&decision.to_string()])
                    .inc();
            }
            TelemetryEvent::Warning { level, .. } => {
                let level = match level {
                    WarningLevel::Info => "info",
                    WarningLevel::Warning => "warning",
                    WarningLevel::Critical => "critical",
                };
                self.warnings_total.with_label_values(&[level]).inc();
            }
            TelemetryEvent::MissionComplete {} => {
                self.missions_finished
                    .with_label_values(&[&MissionStatus::Completed.to_string()])
                    .inc();
            }
            TelemetryEvent::Error { status, .. } => {
                self.missions_finished
                    .with_label_values(&[&status.to_string()])
                    .inc();
            }
            TelemetryEvent::StatusChange { .. } => {}
        }
    }

    /// Drop per-mission series of a mission that is gone
    pub fn forget_mission(&self, mission_id: &str) {
        let _ = self.mission_battery.remove_label_values(&[mission_id]);
        let _ = self.mission_speed.remove_label_values(&[mission_id]);
        let _ = self.mission_altitude.remove_label_values(&[mission_id]);
        let _ = self.waypoints_reached.remove_label_values(&[mission_id]);
    }

    // ========================================================================
    // WEBSOCKET METRICS
    // ========================================================================

    pub fn set_ws_connections(&self, count: i64) {
        self.ws_connections.set(count);
    }

    /// Bring the sent-message counter up to `total`
    pub fn sync_ws_sent(&self, total: u64) {
        let current = self.ws_messages_sent.get();
        if total > current {
            self.ws_messages_sent.inc_by(total - current);
        }
    }

    // ========================================================================
    // API METRICS
    // ========================================================================

    pub fn record_api_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.api_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.api_request_duration
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }
}

/// Feed every envelope from `events` into `metrics` until `shutdown`
pub fn spawn_event_feed(
    metrics: Arc<MetricsCollector>,
    mut events: broadcast::Receiver<TelemetryEnvelope>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(envelope) => metrics.observe(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics feed lagged behind telemetry");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Metrics feed stopped");
    })
}

// ============================================================================
// TESTS
// ============================================================================
