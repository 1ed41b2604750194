//! Telemetry event types for mission execution
//!
//! One event stream exists per mission. Events are wrapped in an envelope
//! carrying a per-mission sequence number and are delivered over the
//! WebSocket hub and the upstream telemetry relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    Approval, Decision, DroneState, DroneStatus, GeoPosition, HumanDecision, MissionId,
    MissionStatus,
};

/// Event envelope for all telemetry emitted by a mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub id: Uuid,
    pub mission_id: MissionId,
    /// Monotonic per-mission counter starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: TelemetryEvent,
}

impl TelemetryEnvelope {
    pub fn new(mission_id: MissionId, sequence: u64, event: TelemetryEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Severity attached to non-fatal warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Info,
    Warning,
    Critical,
}

/// Telemetry event variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TelemetryEvent {
    PositionUpdate {
        position: GeoPosition,
        battery: f64,
        speed: f64,
        heading: f64,
        status: DroneStatus,
        phase: MissionStatus,
        current_waypoint_index: usize,
    },
    WaypointReached {
        current_waypoint_index: usize,
        total_waypoints: usize,
    },
    ApprovalRequired {
        approval: Approval,
    },
    ApprovalResolved {
        approval_id: Uuid,
        decision: Decision,
    },
    StatusChange {
        old: MissionStatus,
        new: MissionStatus,
    },
    Warning {
        level: WarningLevel,
        message: String,
    },
    MissionComplete {},
    Error {
        message: String,
        status: MissionStatus,
    },
}

impl TelemetryEvent {
    pub fn position_update(state: &DroneState) -> Self {
        Self::PositionUpdate {
            position: state.position,
            battery: state.battery,
            speed: state.speed,
            heading: state.heading,
            status: state.status,
            phase: state.phase,
            current_waypoint_index: state.current_waypoint_index,
        }
    }

    pub fn waypoint_reached(current_waypoint_index: usize, total_waypoints: usize) -> Self {
        Self::WaypointReached {
            current_waypoint_index,
            total_waypoints,
        }
    }

    pub fn approval_resolved(decision: &HumanDecision) -> Self {
        Self::ApprovalResolved {
            approval_id: decision.approval_id,
            decision: decision.decision,
        }
    }

    pub fn status_change(old: MissionStatus, new: MissionStatus) -> Self {
        Self::StatusChange { old, new }
    }

    pub fn warning(level: WarningLevel, message: impl Into<String>) -> Self {
        Self::Warning {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, status: MissionStatus) -> Self {
        Self::Error {
            message: message.into(),
            status,
        }
    }

    /// Wire name of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PositionUpdate { .. } => "position_update",
            Self::WaypointReached { .. } => "waypoint_reached",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::StatusChange { .. } => "status_change",
            Self::Warning { .. } => "warning",
            Self::MissionComplete {} => "mission_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event closes the mission's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MissionComplete {} | Self::Error { .. })
    }
}

// ============================================================================
// WEBSOCKET MESSAGE TYPES
// ============================================================================

/// Message sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current snapshot, sent once on connection
    Connected { state: DroneState },
    /// Telemetry update
    Telemetry(TelemetryEnvelope),
    /// Result of a client command
    Ack { message: String },
    /// Error message
    Error { code: String, message: String },
    /// Heartbeat/ping
    Ping { timestamp: i64 },
}

/// Message sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Operator decision on an outstanding approval
    Decision(HumanDecision),
    /// Mission control command
    Command { command: MissionCommand },
    /// Request current state
    RequestState,
    /// Heartbeat/pong
    Pong { timestamp: i64 },
}

/// Mission control command accepted over the WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionCommand {
    Start,
    Pause,
    Resume,
    Abort,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ApprovalKind;

    #[test]
    fn test_event_wire_format() {
        let event = TelemetryEvent::waypoint_reached(1, 3);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "waypoint_reached");
        assert_eq!(json["data"]["current_waypoint_index"], 1);
        assert_eq!(json["data"]["total_waypoints"], 3);

        let complete = serde_json::to_value(TelemetryEvent::MissionComplete {}).unwrap();
        assert_eq!(complete["type"], "mission_complete");
    }

    #[test]
    fn test_envelope_serialization() {
        let approval = Approval::new("m1".into(), ApprovalKind::Anomaly, "Unidentified vehicle")
            .at(GeoPosition::new(49.58, 22.66, 100.0));
        let envelope = TelemetryEnvelope::new(
            "m1".into(),
            7,
            TelemetryEvent::ApprovalRequired { approval },
        );

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: TelemetryEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.event.kind(), "approval_required");
    }

    #[test]
    fn test_terminal_events() {
        assert!(TelemetryEvent::MissionComplete {}.is_terminal());
        assert!(TelemetryEvent::error("link lost", MissionStatus::Failed).is_terminal());
        assert!(!TelemetryEvent::waypoint_reached(0, 1).is_terminal());
    }

    #[test]
    fn test_client_message_parsing() {
        let json = r#"{"type":"command","payload":{"command":"pause"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Command {
                command: MissionCommand::Pause
            }
        ));

        let id = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"decision","payload":{{"approvalId":"{id}","decision":"approved"}}}}"#
        );
        let msg: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(msg, ClientMessage::Decision(d) if d == HumanDecision::approve(id)));
    }
}
