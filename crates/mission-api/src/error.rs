//! API error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mission_core::CoreError;
use mission_engine::EngineError;
use serde::Serialize;
use thiserror::Error;

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Playbook rejected by the validator; carries every violation
    #[error("Invalid playbook: {}", .violations.join("; "))]
    InvalidPlaybook { violations: Vec<String> },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::InvalidPlaybook { .. } => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_type = match &self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::InvalidPlaybook { .. } => "invalid_playbook",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        };
        let message = self.to_string();
        let details = match self {
            ApiError::InvalidPlaybook { violations } => violations,
            _ => Vec::new(),
        };

        let body = Json(ErrorResponse {
            error: error_type.into(),
            message,
            details,
        });

        (status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissionNotFound(_) | CoreError::ApprovalNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            CoreError::MissionAlreadyExists(_)
            | CoreError::MissionAlreadyActive(_)
            | CoreError::MissionNotRunning(_)
            | CoreError::InvalidStateTransition { .. }
            | CoreError::NoPendingApproval(_)
            | CoreError::ApprovalPending(_) => ApiError::Conflict(err.to_string()),
            CoreError::Validation { violations, .. } => ApiError::InvalidPlaybook { violations },
            CoreError::InvalidPosition { .. } | CoreError::InvalidGeoJson(_) | CoreError::Serialization(_) => {
                ApiError::BadRequest(err.to_string())
            }
            CoreError::Configuration(_) | CoreError::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Core(core) => core.into(),
            EngineError::Connection { .. } => ApiError::ServiceUnavailable(err.to_string()),
            EngineError::AbortTimeout(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let cases = [
            (CoreError::mission_not_found("m-1"), StatusCode::NOT_FOUND),
            (CoreError::MissionAlreadyActive("m-1".into()), StatusCode::CONFLICT),
            (CoreError::MissionNotRunning("m-1".into()), StatusCode::CONFLICT),
            (CoreError::invalid_geojson("empty"), StatusCode::BAD_REQUEST),
            (CoreError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_validation_keeps_violations() {
        let err = ApiError::from(EngineError::Core(CoreError::Validation {
            mission_id: "m-1".into(),
            violations: vec!["altitude too high".into(), "speed too high".into()],
        }));

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, ApiError::InvalidPlaybook { ref violations } if violations.len() == 2));
    }

    #[test]
    fn test_connection_failure_is_unavailable() {
        let err = ApiError::from(EngineError::connection(
            "m-1",
            mission_engine::ConnectionError::Unreachable("no route".into()),
        ));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
