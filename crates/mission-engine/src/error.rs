//! Error types for mission execution

use std::fmt;
use std::time::Duration;

use mission_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phase of backend work a fault originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPhase {
    Connect,
    Takeoff,
    Navigate,
    Action,
    Land,
    Abort,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultPhase::Connect => "connect",
            FaultPhase::Takeoff => "takeoff",
            FaultPhase::Navigate => "navigate",
            FaultPhase::Action => "action",
            FaultPhase::Land => "land",
            FaultPhase::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

/// Typed failure from a backend operation; the cause is never empty
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{phase} fault: {cause}")]
pub struct ExecutionFault {
    pub phase: FaultPhase,
    pub cause: String,
}

impl ExecutionFault {
    pub fn new(phase: FaultPhase, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let cause = if cause.trim().is_empty() {
            format!("{phase} failed without a reported cause")
        } else {
            cause
        };
        Self { phase, cause }
    }

    pub fn timeout(phase: FaultPhase, command: &str, limit: Duration) -> Self {
        Self::new(phase, format!("{command} timed out after {limit:?}"))
    }

    pub fn rejected(phase: FaultPhase, command: &str) -> Self {
        Self::new(phase, format!("{command} was rejected by the vehicle"))
    }

    /// Whether this fault came from an ancillary in-place action
    pub fn is_ancillary(&self) -> bool {
        self.phase == FaultPhase::Action
    }
}

/// Failure to establish a session with the executor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Vehicle unreachable: {0}")]
    Unreachable(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Telemetry delivery failure; logged and retried, never fatal to a mission
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Sink connection failed: {0}")]
    Connect(String),

    #[error("Sink send failed: {0}")]
    Send(String),

    #[error("Sink did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscriber lagged, {0} events skipped")]
    Lagged(u64),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error returned by the mission registry
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Mission {mission_id} could not reach its vehicle: {source}")]
    Connection {
        mission_id: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Abort of mission {0} did not complete in time")]
    AbortTimeout(String),
}

impl EngineError {
    pub fn connection(mission_id: impl Into<String>, source: ConnectionError) -> Self {
        Self::Connection {
            mission_id: mission_id.into(),
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_cause_never_empty() {
        let fault = ExecutionFault::new(FaultPhase::Takeoff, "   ");
        assert!(!fault.cause.trim().is_empty());
        assert!(fault.to_string().starts_with("takeoff fault"));
    }

    #[test]
    fn test_fault_helpers() {
        let fault = ExecutionFault::timeout(FaultPhase::Land, "land", Duration::from_secs(30));
        assert_eq!(fault.cause, "land timed out after 30s");

        let fault = ExecutionFault::rejected(FaultPhase::Action, "take_photo");
        assert!(fault.is_ancillary());
        assert!(fault.cause.contains("take_photo"));
    }
}
