//! API request handlers

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use mission_core::geojson::{GeoJsonImport, playbook_from_geojson, waypoints_to_geojson};
use mission_core::{
    DroneState, HumanDecision, MissionId, MissionKind, MissionPlaybook, TelemetryEnvelope,
    ValidationReport, WaypointAction,
};
use mission_engine::{MissionSummary, RegistryStats};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// RESPONSE TYPES
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub api: String,
    pub uptime_secs: i64,
    pub websocket_clients: usize,
    pub active_missions: usize,
    pub relay: Option<String>,
    pub stats: RegistryStats,
}

#[derive(Serialize)]
pub struct MissionCreatedResponse {
    pub mission_id: MissionId,
    pub state: DroneState,
    pub validation: ValidationReport,
    pub stream_url: String,
}

#[derive(Serialize)]
pub struct MissionListResponse {
    pub missions: Vec<MissionSummary>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct MissionDetailResponse {
    pub state: DroneState,
    pub playbook: MissionPlaybook,
    pub validation: ValidationReport,
    pub route: serde_json::Value,
    pub recent_events: Vec<TelemetryEnvelope>,
}

#[derive(Serialize)]
pub struct MissionStateResponse {
    pub mission_id: MissionId,
    pub state: DroneState,
}

#[derive(Serialize)]
pub struct DecisionResponse {
    pub mission_id: MissionId,
    pub accepted: bool,
}

#[derive(Serialize)]
pub struct GeoJsonPlaybookResponse {
    pub playbook: MissionPlaybook,
    pub validation: ValidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
}

#[derive(Serialize)]
pub struct WebSocketInfoResponse {
    pub url: String,
    pub connected_clients: usize,
    pub supported_events: Vec<String>,
    pub client_messages: Vec<String>,
}

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Number of recent telemetry events to include
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_history() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct GeoJsonRequest {
    pub geojson: serde_json::Value,
    #[serde(default)]
    pub mission_id: String,
    #[serde(default)]
    pub mission_type: Option<MissionKind>,
    #[serde(default)]
    pub default_altitude_m: Option<f64>,
    /// Action at every imported waypoint; `null` disables the default photo
    #[serde(default = "default_geojson_action")]
    pub action: Option<WaypointAction>,
    /// Create the mission right away when the playbook is valid
    #[serde(default)]
    pub create: bool,
}

fn default_geojson_action() -> Option<WaypointAction> {
    GeoJsonImport::default().action
}

impl GeoJsonRequest {
    fn import_options(&self) -> GeoJsonImport {
        let defaults = GeoJsonImport::default();
        GeoJsonImport {
            mission_id: self.mission_id.clone(),
            mission_type: self.mission_type.unwrap_or(defaults.mission_type),
            default_altitude_m: self.default_altitude_m.unwrap_or(defaults.default_altitude_m),
            action: self.action,
        }
    }
}

/// Turn an extractor rejection into our error body
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

// ============================================================================
// HEALTH & STATUS HANDLERS
// ============================================================================

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// System status overview
pub async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        api: "running".into(),
        uptime_secs: Utc::now().signed_duration_since(state.started_at).num_seconds(),
        websocket_clients: state.ws_client_count(),
        active_missions: state.registry.active_count(),
        relay: state.config.relay_url.clone(),
        stats: state.registry.stats(),
    })
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.refresh_metrics();
    let body = state
        .metrics
        .export()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

// ============================================================================
// MISSION HANDLERS
// ============================================================================

/// Create a mission from a playbook; starts it when `auto_execute` is set
pub async fn create_mission(
    State(state): State<AppState>,
    payload: Result<Json<MissionPlaybook>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let playbook = body(payload)?;
    let mission_id = state.registry.create_mission(playbook).await?;

    let response = MissionCreatedResponse {
        state: state.registry.get_status(&mission_id)?,
        validation: state.registry.validation_report(&mission_id)?,
        stream_url: stream_url(&state, &mission_id),
        mission_id,
    };
    info!(mission_id = %response.mission_id, "📋 Mission created via API");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Validate a playbook without creating a mission
pub async fn validate_playbook(
    State(state): State<AppState>,
    payload: Result<Json<MissionPlaybook>, JsonRejection>,
) -> ApiResult<Json<ValidationReport>> {
    let playbook = body(payload)?;
    let report = state.registry.validator().validate(&playbook);
    debug!(mission_id = %report.mission_id, valid = report.is_valid(), "Playbook validated");
    Ok(Json(report))
}

/// List all missions
pub async fn list_missions(State(state): State<AppState>) -> impl IntoResponse {
    let missions = state.registry.list_missions();
    let total = missions.len();
    Json(MissionListResponse { missions, total })
}

/// Get one mission with its playbook and recent telemetry
pub async fn get_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<MissionDetailResponse>> {
    let id = MissionId::new(id);
    let playbook = state.registry.playbook(&id)?;

    Ok(Json(MissionDetailResponse {
        state: state.registry.get_status(&id)?,
        validation: state.registry.validation_report(&id)?,
        route: waypoints_to_geojson(&playbook.waypoints),
        recent_events: state.registry.history(&id, query.history)?,
        playbook: playbook.as_ref().clone(),
    }))
}

pub async fn start_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MissionStateResponse>> {
    let id = MissionId::new(id);
    state.registry.start_mission(&id).await?;
    info!(mission_id = %id, "🚀 Mission started via API");
    mission_state(&state, id)
}

pub async fn pause_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MissionStateResponse>> {
    let id = MissionId::new(id);
    state.registry.pause_mission(&id).await?;
    info!(mission_id = %id, "⏸️ Mission paused via API");
    mission_state(&state, id)
}

pub async fn resume_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MissionStateResponse>> {
    let id = MissionId::new(id);
    state.registry.resume_mission(&id).await?;
    info!(mission_id = %id, "▶️ Mission resumed via API");
    mission_state(&state, id)
}

pub async fn abort_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MissionStateResponse>> {
    let id = MissionId::new(id);
    state.registry.abort_mission(&id).await?;
    info!(mission_id = %id, "🛑 Mission aborted via API");
    mission_state(&state, id)
}

fn mission_state(state: &AppState, mission_id: MissionId) -> ApiResult<Json<MissionStateResponse>> {
    let drone = state.registry.get_status(&mission_id)?;
    Ok(Json(MissionStateResponse {
        mission_id,
        state: drone,
    }))
}

// ============================================================================
// APPROVAL HANDLERS
// ============================================================================

/// Route an operator decision to the mission waiting on it
pub async fn submit_decision(
    State(state): State<AppState>,
    payload: Result<Json<HumanDecision>, JsonRejection>,
) -> ApiResult<Json<DecisionResponse>> {
    let decision = body(payload)?;
    let approval_id = decision.approval_id;
    let mission_id = state.registry.submit_decision(decision).await?;

    info!(mission_id = %mission_id, %approval_id, "Operator decision applied");
    Ok(Json(DecisionResponse {
        mission_id,
        accepted: true,
    }))
}

// ============================================================================
// PLAYBOOK HANDLERS
// ============================================================================

/// Convert map features into a playbook, optionally creating the mission
pub async fn playbook_from_features(
    State(state): State<AppState>,
    payload: Result<Json<GeoJsonRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    let playbook = playbook_from_geojson(&request.geojson, &request.import_options())?;
    let validation = state.registry.validator().validate(&playbook);

    if !request.create {
        return Ok((
            StatusCode::OK,
            Json(GeoJsonPlaybookResponse {
                playbook,
                validation,
                mission_id: None,
            }),
        ));
    }

    let mission_id = state.registry.create_mission(playbook).await?;
    let playbook = state.registry.playbook(&mission_id)?.as_ref().clone();
    info!(mission_id = %mission_id, waypoints = playbook.waypoints.len(), "📋 Mission created from GeoJSON");

    Ok((
        StatusCode::CREATED,
        Json(GeoJsonPlaybookResponse {
            playbook,
            validation,
            mission_id: Some(mission_id),
        }),
    ))
}

// ============================================================================
// WEBSOCKET INFO
// ============================================================================

/// WebSocket connection info
pub async fn websocket_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(WebSocketInfoResponse {
        url: format!(
            "ws://{}:{}{}{{mission_id}}",
            state.config.host,
            state.config.ws_port,
            mission_websocket::MISSION_PATH_PREFIX
        ),
        connected_clients: state.ws_client_count(),
        supported_events: [
            "position_update",
            "waypoint_reached",
            "approval_required",
            "approval_resolved",
            "status_change",
            "warning",
            "mission_complete",
            "error",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        client_messages: ["decision", "command", "request_state", "pong"]
            .into_iter()
            .map(String::from)
            .collect(),
    })
}

fn stream_url(state: &AppState, mission_id: &MissionId) -> String {
    format!(
        "ws://{}:{}{}{}",
        state.config.host,
        state.config.ws_port,
        mission_websocket::MISSION_PATH_PREFIX,
        mission_id
    )
}
