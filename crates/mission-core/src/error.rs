//! Error types for mission playbook handling

use thiserror::Error;

/// Core error type for the mission control system
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Mission not found: {0}")]
    MissionNotFound(String),

    #[error("Mission already exists: {0}")]
    MissionAlreadyExists(String),

    #[error("Mission already active: {0}")]
    MissionAlreadyActive(String),

    #[error("Mission not running: {0}")]
    MissionNotRunning(String),

    #[error("Playbook {mission_id} failed validation: {}", .violations.join("; "))]
    Validation {
        mission_id: String,
        violations: Vec<String>,
    },

    #[error("Invalid position: latitude={lat}, longitude={lon}")]
    InvalidPosition { lat: f64, lon: f64 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No approval pending for mission {0}")]
    NoPendingApproval(String),

    #[error("Approval already pending for mission {0}")]
    ApprovalPending(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn mission_not_found(id: impl Into<String>) -> Self {
        Self::MissionNotFound(id.into())
    }

    pub fn invalid_position(lat: f64, lon: f64) -> Self {
        Self::InvalidPosition { lat, lon }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_geojson(msg: impl Into<String>) -> Self {
        Self::InvalidGeoJson(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
