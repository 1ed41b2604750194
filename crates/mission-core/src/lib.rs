//! # Mission Core
//!
//! Core domain models and types for mission playbook execution.
//! This crate provides the playbook schema, the drone state published to
//! observers, approvals, telemetry events and the pre-flight validator
//! shared by the engine, the WebSocket hub and the REST API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub mod error;
pub mod events;
pub mod geo;
pub mod geojson;
pub mod pattern;
pub mod validation;

pub use error::{CoreError, CoreResult};
pub use events::*;
pub use geo::*;
pub use validation::{PlaybookValidator, SafetyBounds, ValidationReport, Violation};

/// Hover time used when a `hover` action has no explicit duration
pub const DEFAULT_HOVER_SECS: f64 = 5.0;

// ============================================================================
// MISSION IDENTIFIERS
// ============================================================================

/// Unique identifier for a mission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MissionId(pub String);

impl MissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for playbooks submitted without one
    pub fn generate() -> Self {
        Self(format!("mission-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MissionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MissionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of mission described by a playbook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    Patrol,
    Reconnaissance,
    Tracking,
    Search,
    Delivery,
}

impl MissionKind {
    /// Whether the route returns to its first waypoint after the last one
    pub fn loops_by_default(&self) -> bool {
        matches!(self, MissionKind::Patrol)
    }
}

impl fmt::Display for MissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionKind::Patrol => "patrol",
            MissionKind::Reconnaissance => "reconnaissance",
            MissionKind::Tracking => "tracking",
            MissionKind::Search => "search",
            MissionKind::Delivery => "delivery",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// WAYPOINT MODELS
// ============================================================================

/// In-place action performed on arrival at a waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointAction {
    Photo,
    VideoStart,
    VideoStop,
    Hover,
    Scan,
}

impl fmt::Display for WaypointAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaypointAction::Photo => "photo",
            WaypointAction::VideoStart => "video_start",
            WaypointAction::VideoStop => "video_stop",
            WaypointAction::Hover => "hover",
            WaypointAction::Scan => "scan",
        };
        write!(f, "{s}")
    }
}

/// A waypoint in a mission playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    /// Altitude in meters above ground
    pub alt: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<WaypointAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover_duration_sec: Option<f64>,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            lat,
            lon,
            alt,
            action: None,
            hover_duration_sec: None,
        }
    }

    pub fn with_action(mut self, action: WaypointAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_hover(mut self, seconds: f64) -> Self {
        self.action = Some(WaypointAction::Hover);
        self.hover_duration_sec = Some(seconds);
        self
    }

    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.lat, self.lon, self.alt)
    }

    /// Time spent stationary at this waypoint
    pub fn hover_duration(&self) -> Duration {
        let secs = match (self.action, self.hover_duration_sec) {
            (_, Some(secs)) => secs,
            (Some(WaypointAction::Hover), None) => DEFAULT_HOVER_SECS,
            _ => 0.0,
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

impl From<&Waypoint> for GeoPosition {
    fn from(wp: &Waypoint) -> Self {
        wp.position()
    }
}

// ============================================================================
// FLIGHT PARAMETERS
// ============================================================================

/// Navigation pattern flown between waypoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationPattern {
    #[default]
    Direct,
    Grid,
    Spiral,
    Perimeter,
}

/// How the vehicle orients itself while moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingMode {
    #[default]
    Auto,
    Fixed,
    TargetOriented,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightParameters {
    /// Cruise altitude in meters
    pub altitude_m: f64,
    /// Cruise speed in meters per second
    pub speed_mps: f64,
    pub pattern: NavigationPattern,
    pub heading_mode: HeadingMode,
}

impl Default for FlightParameters {
    fn default() -> Self {
        Self {
            altitude_m: 120.0,
            speed_mps: 10.0,
            pattern: NavigationPattern::Direct,
            heading_mode: HeadingMode::Auto,
        }
    }
}

// ============================================================================
// CONTINGENCY POLICY
// ============================================================================

/// Abnormal condition a playbook configures a response for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    LowBattery,
    GpsLoss,
    ObstacleDetected,
    CommunicationLoss,
}

impl FaultKind {
    pub const ALL: [FaultKind; 4] = [
        FaultKind::LowBattery,
        FaultKind::GpsLoss,
        FaultKind::ObstacleDetected,
        FaultKind::CommunicationLoss,
    ];
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::LowBattery => "low_battery",
            FaultKind::GpsLoss => "gps_loss",
            FaultKind::ObstacleDetected => "obstacle_detected",
            FaultKind::CommunicationLoss => "communication_loss",
        };
        write!(f, "{s}")
    }
}

/// Remedial action taken when a contingency fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContingencyAction {
    ReturnToHome,
    LandImmediately,
    #[serde(alias = "alert_and_hover", alias = "hover")]
    HoverAndAlert,
    Reroute,
    AbortMission,
    #[serde(alias = "switch_to_visual")]
    ContinueMission,
}

impl fmt::Display for ContingencyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContingencyAction::ReturnToHome => "return_to_home",
            ContingencyAction::LandImmediately => "land_immediately",
            ContingencyAction::HoverAndAlert => "hover_and_alert",
            ContingencyAction::Reroute => "reroute",
            ContingencyAction::AbortMission => "abort_mission",
            ContingencyAction::ContinueMission => "continue_mission",
        };
        write!(f, "{s}")
    }
}

/// Per-fault remedial actions; absent entries fall back to defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContingencyPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_battery: Option<ContingencyAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_loss: Option<ContingencyAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obstacle_detected: Option<ContingencyAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub communication_loss: Option<ContingencyAction>,
}

impl ContingencyPolicy {
    /// Action configured for a fault kind, if any
    pub fn configured(&self, kind: FaultKind) -> Option<ContingencyAction> {
        match kind {
            FaultKind::LowBattery => self.low_battery,
            FaultKind::GpsLoss => self.gps_loss,
            FaultKind::ObstacleDetected => self.obstacle_detected,
            FaultKind::CommunicationLoss => self.communication_loss,
        }
    }

    /// Default action for a fault kind
    pub fn default_action(kind: FaultKind) -> ContingencyAction {
        match kind {
            FaultKind::LowBattery => ContingencyAction::ReturnToHome,
            FaultKind::GpsLoss => ContingencyAction::HoverAndAlert,
            FaultKind::ObstacleDetected => ContingencyAction::Reroute,
            FaultKind::CommunicationLoss => ContingencyAction::HoverAndAlert,
        }
    }

    /// Effective action for a fault kind
    pub fn action_for(&self, kind: FaultKind) -> ContingencyAction {
        self.configured(kind)
            .unwrap_or_else(|| Self::default_action(kind))
    }

    /// Fault kinds that had no explicit action
    pub fn defaulted_kinds(&self) -> Vec<FaultKind> {
        FaultKind::ALL
            .into_iter()
            .filter(|kind| self.configured(*kind).is_none())
            .collect()
    }

    /// Copy of this policy with every default filled in
    pub fn resolved(&self) -> Self {
        Self {
            low_battery: Some(self.action_for(FaultKind::LowBattery)),
            gps_loss: Some(self.action_for(FaultKind::GpsLoss)),
            obstacle_detected: Some(self.action_for(FaultKind::ObstacleDetected)),
            communication_loss: Some(self.action_for(FaultKind::CommunicationLoss)),
        }
    }
}

// ============================================================================
// PLAYBOOK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    #[default]
    Photo,
    Video,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub resolution: String,
    pub fps: u32,
    pub mode: CameraMode,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            resolution: "4K".to_string(),
            fps: 30,
            mode: CameraMode::Photo,
        }
    }
}

/// Geographic area a mission operates over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfInterest {
    pub center: AreaCenter,
    pub radius_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaCenter {
    pub lat: f64,
    pub lon: f64,
}

fn default_max_duration_min() -> f64 {
    30.0
}

/// Declarative mission definition: waypoints, parameters and contingencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPlaybook {
    #[serde(default)]
    pub mission_id: String,
    pub mission_type: MissionKind,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_of_interest: Option<AreaOfInterest>,
    pub waypoints: Vec<Waypoint>,
    #[serde(default)]
    pub flight_parameters: FlightParameters,
    #[serde(default)]
    pub contingencies: ContingencyPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_settings: Option<CameraSettings>,
    /// Start execution as soon as the mission is created
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default = "default_max_duration_min")]
    pub max_duration_min: f64,
}

impl MissionPlaybook {
    pub fn new(mission_id: impl Into<String>, mission_type: MissionKind) -> Self {
        Self {
            mission_id: mission_id.into(),
            mission_type,
            description: String::new(),
            area_of_interest: None,
            waypoints: Vec::new(),
            flight_parameters: FlightParameters::default(),
            contingencies: ContingencyPolicy::default(),
            camera_settings: None,
            auto_execute: false,
            max_duration_min: default_max_duration_min(),
        }
    }

    /// Parse a playbook from its JSON representation
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_waypoint(mut self, waypoint: Waypoint) -> Self {
        self.waypoints.push(waypoint);
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.flight_parameters.speed_mps = speed_mps;
        self
    }

    pub fn with_max_duration(mut self, minutes: f64) -> Self {
        self.max_duration_min = minutes;
        self
    }

    pub fn max_duration(&self) -> Duration {
        Duration::try_from_secs_f64((self.max_duration_min * 60.0).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Route length in kilometers, optionally closing the loop back to the first waypoint
    pub fn route_length_km(&self, looping: bool) -> f64 {
        let legs: f64 = self
            .waypoints
            .windows(2)
            .map(|w| w[0].position().distance_to(&w[1].position()))
            .sum();

        match (looping, self.waypoints.first(), self.waypoints.last()) {
            (true, Some(first), Some(last)) if self.waypoints.len() > 1 => {
                legs + last.position().distance_to(&first.position())
            }
            _ => legs,
        }
    }
}

// ============================================================================
// MISSION STATUS
// ============================================================================

/// Mission phase driven by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Planned,
    TakingOff,
    EnRoute,
    AwaitingApproval,
    Returning,
    Landing,
    Completed,
    Aborted,
    Failed,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Aborted | MissionStatus::Failed
        )
    }

    /// Whether the vehicle is expected to be off the ground
    pub fn is_airborne(&self) -> bool {
        matches!(
            self,
            MissionStatus::TakingOff
                | MissionStatus::EnRoute
                | MissionStatus::AwaitingApproval
                | MissionStatus::Returning
                | MissionStatus::Landing
        )
    }

    /// Check a phase transition against the mission lifecycle
    pub fn can_transition_to(&self, next: MissionStatus) -> bool {
        use MissionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Aborted | Failed) {
            return true;
        }

        matches!(
            (self, next),
            (Planned, TakingOff)
                | (TakingOff, EnRoute)
                | (TakingOff, Landing)
                | (EnRoute, AwaitingApproval)
                | (EnRoute, Returning)
                | (EnRoute, Landing)
                | (AwaitingApproval, EnRoute)
                | (AwaitingApproval, Returning)
                | (Returning, AwaitingApproval)
                | (Returning, Landing)
                | (Landing, Completed)
        )
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionStatus::Planned => "planned",
            MissionStatus::TakingOff => "taking_off",
            MissionStatus::EnRoute => "en_route",
            MissionStatus::AwaitingApproval => "awaiting_approval",
            MissionStatus::Returning => "returning",
            MissionStatus::Landing => "landing",
            MissionStatus::Completed => "completed",
            MissionStatus::Aborted => "aborted",
            MissionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// DRONE STATE
// ============================================================================

/// Coarse lifecycle status reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    /// On the ground, before launch or after a terminal phase
    #[default]
    Idle,
    /// Climbing or flying the route
    EnRoute,
    /// Holding position until an operator decides
    AwaitingApproval,
    /// Heading home or descending
    Returning,
}

impl From<MissionStatus> for DroneStatus {
    fn from(phase: MissionStatus) -> Self {
        match phase {
            MissionStatus::TakingOff | MissionStatus::EnRoute => DroneStatus::EnRoute,
            MissionStatus::AwaitingApproval => DroneStatus::AwaitingApproval,
            MissionStatus::Returning | MissionStatus::Landing => DroneStatus::Returning,
            MissionStatus::Planned
            | MissionStatus::Completed
            | MissionStatus::Aborted
            | MissionStatus::Failed => DroneStatus::Idle,
        }
    }
}

impl fmt::Display for DroneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DroneStatus::Idle => "idle",
            DroneStatus::EnRoute => "en_route",
            DroneStatus::AwaitingApproval => "awaiting_approval",
            DroneStatus::Returning => "returning",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a mission's vehicle, published after every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroneState {
    pub mission_id: MissionId,
    pub position: GeoPosition,
    /// Battery level percentage (0-100)
    pub battery: f64,
    /// Ground speed in m/s
    pub speed: f64,
    /// Heading in degrees (0-360)
    pub heading: f64,
    pub status: DroneStatus,
    pub phase: MissionStatus,
    pub current_waypoint_index: usize,
    pub total_waypoints: usize,
    pub paused: bool,
    pub updated_at: DateTime<Utc>,
}

impl DroneState {
    pub fn new(mission_id: MissionId, home: GeoPosition, total_waypoints: usize) -> Self {
        Self {
            mission_id,
            position: home,
            battery: 100.0,
            speed: 0.0,
            heading: 0.0,
            status: DroneStatus::Idle,
            phase: MissionStatus::Planned,
            current_waypoint_index: 0,
            total_waypoints,
            paused: false,
            updated_at: Utc::now(),
        }
    }

    /// Move to a new phase and derive the observer status from it
    pub fn set_phase(&mut self, phase: MissionStatus) {
        self.phase = phase;
        self.status = DroneStatus::from(phase);
        if !phase.is_airborne() {
            self.speed = 0.0;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

// ============================================================================
// APPROVALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Anomaly,
    Deviation,
    HighRisk,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalKind::Anomaly => "anomaly",
            ApprovalKind::Deviation => "deviation",
            ApprovalKind::HighRisk => "high_risk",
        };
        write!(f, "{s}")
    }
}

/// A request for a human decision while navigation is held
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub mission_id: MissionId,
    pub kind: ApprovalKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPosition>,
    pub timestamp: DateTime<Utc>,
}

impl Approval {
    pub fn new(mission_id: MissionId, kind: ApprovalKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            kind,
            description: description.into(),
            location: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, location: GeoPosition) -> Self {
        self.location = Some(location);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Denied,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Denied => write!(f, "denied"),
        }
    }
}

/// Operator answer to an outstanding approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanDecision {
    #[serde(alias = "approval_id")]
    pub approval_id: Uuid,
    pub decision: Decision,
}

impl HumanDecision {
    pub fn approve(approval_id: Uuid) -> Self {
        Self {
            approval_id,
            decision: Decision::Approved,
        }
    }

    pub fn deny(approval_id: Uuid) -> Self {
        Self {
            approval_id,
            decision: Decision::Denied,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYBOOK_JSON: &str = r#"{
        "mission_id": "patrol-001",
        "mission_type": "patrol",
        "waypoints": [
            {"lat": 49.588, "lon": 22.676, "alt": 100, "action": "photo"},
            {"lat": 49.576, "lon": 22.651, "alt": 100, "action": "hover", "hover_duration_sec": 10}
        ],
        "flight_parameters": {"altitude_m": 100, "speed_mps": 12, "pattern": "direct"},
        "contingencies": {"low_battery": "land_immediately", "gps_loss": "switch_to_visual"}
    }"#;

    #[test]
    fn test_playbook_parsing_applies_defaults() {
        let playbook = MissionPlaybook::from_json(PLAYBOOK_JSON).unwrap();

        assert_eq!(playbook.mission_type, MissionKind::Patrol);
        assert_eq!(playbook.waypoints.len(), 2);
        assert_eq!(playbook.flight_parameters.speed_mps, 12.0);
        assert_eq!(playbook.flight_parameters.heading_mode, HeadingMode::Auto);
        assert_eq!(playbook.max_duration_min, 30.0);
        assert!(!playbook.auto_execute);
        assert_eq!(
            playbook.waypoints[1].hover_duration(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_contingency_defaults_and_aliases() {
        let playbook = MissionPlaybook::from_json(PLAYBOOK_JSON).unwrap();
        let policy = &playbook.contingencies;

        assert_eq!(
            policy.action_for(FaultKind::LowBattery),
            ContingencyAction::LandImmediately
        );
        assert_eq!(
            policy.action_for(FaultKind::GpsLoss),
            ContingencyAction::ContinueMission
        );
        assert_eq!(
            policy.action_for(FaultKind::ObstacleDetected),
            ContingencyAction::Reroute
        );
        assert_eq!(
            policy.action_for(FaultKind::CommunicationLoss),
            ContingencyAction::HoverAndAlert
        );
        assert_eq!(
            policy.defaulted_kinds(),
            vec![FaultKind::ObstacleDetected, FaultKind::CommunicationLoss]
        );
        assert!(policy.resolved().defaulted_kinds().is_empty());
    }

    #[test]
    fn test_hover_duration_defaults() {
        assert_eq!(
            Waypoint::new(0.0, 0.0, 50.0)
                .with_action(WaypointAction::Hover)
                .hover_duration(),
            Duration::from_secs(5)
        );
        assert_eq!(
            Waypoint::new(0.0, 0.0, 50.0)
                .with_action(WaypointAction::Photo)
                .hover_duration(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_route_length_with_loop_closure() {
        let playbook = MissionPlaybook::new("loop", MissionKind::Patrol)
            .with_waypoint(Waypoint::new(0.0, 0.0, 100.0))
            .with_waypoint(Waypoint::new(0.0, 0.01, 100.0));

        let open = playbook.route_length_km(false);
        let closed = playbook.route_length_km(true);
        assert!((closed - open * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_mission_status_transitions() {
        use MissionStatus::*;

        assert!(Planned.can_transition_to(TakingOff));
        assert!(EnRoute.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(EnRoute));
        assert!(Returning.can_transition_to(AwaitingApproval));
        assert!(Landing.can_transition_to(Completed));
        assert!(EnRoute.can_transition_to(Failed));

        assert!(!Planned.can_transition_to(EnRoute));
        assert!(!AwaitingApproval.can_transition_to(Landing));
        assert!(!Completed.can_transition_to(Aborted));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_drone_status_follows_phase() {
        let mut state = DroneState::new("m1".into(), GeoPosition::default(), 3);
        assert_eq!(state.status, DroneStatus::Idle);

        state.set_phase(MissionStatus::TakingOff);
        assert_eq!(state.status, DroneStatus::EnRoute);

        state.set_phase(MissionStatus::Landing);
        assert_eq!(state.status, DroneStatus::Returning);

        state.set_phase(MissionStatus::Aborted);
        assert_eq!(state.status, DroneStatus::Idle);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_human_decision_wire_format() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"approvalId":"{id}","decision":"denied"}}"#);
        let decision: HumanDecision = serde_json::from_str(&json).unwrap();

        assert_eq!(decision, HumanDecision::deny(id));
        assert_eq!(serde_json::to_string(&decision).unwrap(), json);
    }
}
