//! WebSocket error types

use mission_core::CoreError;
use mission_engine::EngineError;
use thiserror::Error;

/// WebSocket errors
#[derive(Error, Debug)]
pub enum WsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not a mission stream path: {0}")]
    InvalidPath(String),
}

impl WsError {
    /// Stable code sent to clients in `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            WsError::Json(_) | WsError::InvalidPath(_) => "bad_request",
            WsError::Engine(EngineError::Core(core)) => match core {
                CoreError::MissionNotFound(_) | CoreError::ApprovalNotFound(_) => "not_found",
                CoreError::MissionAlreadyActive(_)
                | CoreError::MissionNotRunning(_)
                | CoreError::NoPendingApproval(_)
                | CoreError::ApprovalPending(_)
                | CoreError::InvalidStateTransition { .. } => "conflict",
                CoreError::Validation { .. } => "invalid_playbook",
                _ => "internal",
            },
            WsError::Engine(EngineError::Connection { .. }) => "vehicle_unreachable",
            _ => "internal",
        }
    }
}

pub type WsResult<T> = Result<T, WsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let not_found = WsError::from(EngineError::from(CoreError::mission_not_found("m-1")));
        assert_eq!(not_found.code(), "not_found");

        let conflict = WsError::from(EngineError::from(CoreError::MissionNotRunning("m-1".into())));
        assert_eq!(conflict.code(), "conflict");

        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(WsError::from(bad).code(), "bad_request");
    }
}
