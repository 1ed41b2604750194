//! # Mission Engine
//!
//! Executes validated mission playbooks against an execution backend.
//!
//! ## Features
//! - Phase state machine with lifecycle-checked transitions
//! - Waypoint navigation for linear, looping and return-home routes
//! - Contingency handling and human-in-the-loop approvals
//! - Simulated and vehicle-driver execution backends
//! - Per-mission telemetry channel with bounded history and upstream relay
//! - Mission registry owning every mission's runner task

pub mod approval;
pub mod backend;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod contingency;
pub mod error;
pub mod machine;
pub mod navigator;
pub mod registry;
pub mod runner;
pub mod ticker;

pub use approval::{ApprovalGate, Resolution};
pub use backend::{
    BackendFactory, ExecutionBackend, FaultPlan, FaultTrigger, Injection, Signal, SimulatedBackend,
    SimulatedBackendFactory, VehicleBackend, VehicleBackendFactory, VehicleDriver,
};
pub use channel::{RelayOutcome, SinkFactory, TelemetryChannel, TelemetryRelay, TelemetrySink};
pub use config::{
    ApprovalConfig, ApprovalTimeoutPolicy, ApprovalTrigger, BackendTimeouts, EngineConfig, RetryPolicy,
    SimulationConfig,
};
pub use contingency::{ContingencyHandler, LateralOffsetReroute, RerouteHook, Remedy};
pub use error::{
    ChannelError, ChannelResult, ConnectionError, EngineError, EngineResult, ExecutionFault, FaultPhase,
};
pub use machine::MissionStateMachine;
pub use navigator::{Leg, LegKind, RoutePolicy, WaypointNavigator};
pub use registry::{MissionRegistry, MissionSummary, RegistryStats};
pub use runner::{Control, ControlCommand, MissionRunner};
pub use ticker::{IntervalTicker, ManualTicker, Ticker};
