//! Execution backends.
//!
//! A backend is the executor the state machine drives: either a vehicle
//! driver or a software stand-in. Both implement [`ExecutionBackend`] with
//! identical semantics, so the state machine never knows which one it has.
//! Methods take `&self` so `abort()` can be issued while a `move_to` is
//! still in flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mission_core::{ApprovalKind, GeoPosition, MissionPlaybook, WaypointAction};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{ConnectionError, ExecutionFault};
use crate::navigator::Leg;

pub mod simulated;
pub mod vehicle;

pub use simulated::{FaultInjector, FaultPlan, FaultTrigger, Injection, InjectionPoint, SimulatedBackend};
pub use vehicle::{DriverError, DriverTarget, DriverTelemetry, VehicleBackend, VehicleDriver};

/// Abnormal condition observed during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    LinkLost,
    GpsLost,
    Obstacle,
}

/// Progress sample reported at least once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub position: GeoPosition,
    pub heading: f64,
    pub speed: f64,
    pub battery: f64,
    /// Fraction of the current operation completed, 0.0 to 1.0
    pub fraction: f64,
    pub signals: Vec<Signal>,
}

pub type ProgressTx = mpsc::Sender<Progress>;

/// Something an operator should look at before the mission continues
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyReport {
    pub kind: ApprovalKind,
    pub description: String,
}

impl AnomalyReport {
    pub fn new(kind: ApprovalKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

/// Session established with the executor
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    /// Current vehicle position, if the executor knows it
    pub home: Option<GeoPosition>,
    pub battery: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reached {
    pub position: GeoPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub action: WaypointAction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landed {
    pub position: GeoPosition,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish a session; idempotent once connected
    async fn connect(&self) -> Result<Connected, ConnectionError>;

    async fn takeoff(&self, target_altitude: f64, progress: &ProgressTx) -> Result<Reached, ExecutionFault>;

    /// Fly a leg, reporting progress at least once per tick
    async fn move_to(&self, leg: &Leg, progress: &ProgressTx) -> Result<Reached, ExecutionFault>;

    async fn perform_action(
        &self,
        action: WaypointAction,
        hover: Duration,
        progress: &ProgressTx,
    ) -> Result<Done, ExecutionFault>;

    async fn land(&self, progress: &ProgressTx) -> Result<Landed, ExecutionFault>;

    /// Force an immediate landing from any state, including mid-`move_to`
    async fn abort(&self) -> Result<Landed, ExecutionFault>;

    /// Freeze navigation at the current position
    async fn hold(&self) -> Result<(), ExecutionFault>;

    /// Resume navigation from where `hold` froze it
    async fn release(&self) -> Result<(), ExecutionFault>;

    /// Anomaly needing operator approval, if one is detected now
    fn detect_anomaly(&self) -> Option<AnomalyReport>;

    async fn disconnect(&self);
}

/// Builds the backend for a mission at start time
pub trait BackendFactory: Send + Sync {
    fn create(&self, playbook: &MissionPlaybook, config: &EngineConfig) -> Arc<dyn ExecutionBackend>;
}

/// Factory for [`SimulatedBackend`] driven by an interval ticker
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackendFactory {
    faults: Option<Arc<FaultPlan>>,
}

impl SimulatedBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the same fault plan to every backend created
    pub fn with_faults(faults: Arc<FaultPlan>) -> Self {
        Self {
            faults: Some(faults),
        }
    }
}

impl BackendFactory for SimulatedBackendFactory {
    fn create(&self, playbook: &MissionPlaybook, config: &EngineConfig) -> Arc<dyn ExecutionBackend> {
        let mut backend = SimulatedBackend::from_config(playbook, config);
        if let Some(faults) = &self.faults {
            backend = backend.with_fault_injector(faults.clone());
        }
        Arc::new(backend)
    }
}

/// Factory wrapping a shared [`VehicleDriver`]
pub struct VehicleBackendFactory {
    driver: Arc<dyn VehicleDriver>,
}

impl VehicleBackendFactory {
    pub fn new(driver: Arc<dyn VehicleDriver>) -> Self {
        Self { driver }
    }
}

impl BackendFactory for VehicleBackendFactory {
    fn create(&self, playbook: &MissionPlaybook, config: &EngineConfig) -> Arc<dyn ExecutionBackend> {
        Arc::new(VehicleBackend::from_config(self.driver.clone(), playbook, config))
    }
}
