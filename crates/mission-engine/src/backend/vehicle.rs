//! Vehicle driver backend.
//!
//! Wraps a command-level [`VehicleDriver`] and gives it the same semantics as
//! the simulated backend: every call is bounded by a timeout, negative
//! acknowledgements become typed faults and progress is reported from
//! telemetry polled once per tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mission_core::{ApprovalKind, GeoPosition, MissionPlaybook, WaypointAction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::{
    AnomalyReport, Connected, Done, ExecutionBackend, Landed, Progress, ProgressTx, Reached, Signal,
};
use crate::config::{BackendTimeouts, EngineConfig};
use crate::error::{ConnectionError, ExecutionFault, FaultPhase};
use crate::navigator::Leg;
use crate::ticker::{IntervalTicker, Ticker};

/// Minimum orbit time for a scan
const SCAN_SECS: u64 = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Link error: {0}")]
    Link(String),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Navigation target in the driver's `[lon, lat, alt]` convention
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverTarget {
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
}

impl DriverTarget {
    pub fn from_position(position: &GeoPosition) -> Self {
        Self {
            longitude: position.longitude,
            latitude: position.latitude,
            altitude: position.altitude,
        }
    }

    pub fn to_position(&self) -> GeoPosition {
        GeoPosition::new(self.latitude, self.longitude, self.altitude)
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.longitude, self.latitude, self.altitude]
    }
}

/// One telemetry sample from the vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct DriverTelemetry {
    pub position: GeoPosition,
    pub battery: f64,
    pub speed: f64,
    pub heading: f64,
    pub gps_fix: bool,
    pub link_ok: bool,
    pub obstacle: bool,
    /// Onboard detection needing operator review
    pub detection: Option<String>,
}

/// Command-level interface to a physical or SITL vehicle.
///
/// Commands resolve to `Ok(true)` on acknowledgement and `Ok(false)` when the
/// vehicle refuses; `move_to` resolves on arrival.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VehicleDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<bool>;
    async fn disconnect(&self) -> DriverResult<()>;
    async fn take_off(&self, altitude: f64) -> DriverResult<bool>;
    async fn move_to(&self, target: DriverTarget, max_speed: f64) -> DriverResult<bool>;
    async fn hold_position(&self) -> DriverResult<bool>;
    async fn take_photo(&self) -> DriverResult<bool>;
    async fn start_recording(&self) -> DriverResult<bool>;
    async fn stop_recording(&self) -> DriverResult<bool>;
    async fn circle(&self, duration: Duration) -> DriverResult<bool>;
    async fn land(&self) -> DriverResult<bool>;
    async fn emergency_land(&self) -> DriverResult<bool>;
    async fn telemetry(&self) -> DriverResult<DriverTelemetry>;
}

/// Turns level conditions from telemetry into one signal per onset
#[derive(Debug, Default)]
struct SignalLatch {
    gps_lost: bool,
    link_lost: bool,
    obstacle: bool,
}

impl SignalLatch {
    fn update(&mut self, gps_lost: bool, link_lost: bool, obstacle: bool) -> Vec<Signal> {
        let mut raised = Vec::new();
        for (now, was, signal) in [
            (gps_lost, &mut self.gps_lost, Signal::GpsLost),
            (link_lost, &mut self.link_lost, Signal::LinkLost),
            (obstacle, &mut self.obstacle, Signal::Obstacle),
        ] {
            if now && !*was {
                raised.push(signal);
            }
            *was = now;
        }
        raised
    }
}

pub struct VehicleBackend {
    driver: Arc<dyn VehicleDriver>,
    timeouts: BackendTimeouts,
    speed_mps: f64,
    ticker: tokio::sync::Mutex<Box<dyn Ticker>>,
    held: watch::Sender<bool>,
    last: Mutex<Option<DriverTelemetry>>,
    latch: Mutex<SignalLatch>,
    detection: Mutex<Option<String>>,
}

impl VehicleBackend {
    pub fn new(
        driver: Arc<dyn VehicleDriver>,
        timeouts: BackendTimeouts,
        speed_mps: f64,
        ticker: Box<dyn Ticker>,
    ) -> Self {
        Self {
            driver,
            timeouts,
            speed_mps,
            ticker: tokio::sync::Mutex::new(ticker),
            held: watch::Sender::new(false),
            last: Mutex::new(None),
            latch: Mutex::new(SignalLatch::default()),
            detection: Mutex::new(None),
        }
    }

    pub fn from_config(driver: Arc<dyn VehicleDriver>, playbook: &MissionPlaybook, config: &EngineConfig) -> Self {
        Self::new(
            driver,
            config.timeouts.clone(),
            playbook.flight_parameters.speed_mps,
            Box::new(IntervalTicker::new(config.tick_interval)),
        )
    }

    /// Run a driver command under a deadline and map its outcome to a fault
    async fn command<F>(&self, phase: FaultPhase, name: &str, limit: Duration, call: F) -> Result<(), ExecutionFault>
    where
        F: Future<Output = DriverResult<bool>> + Send,
    {
        match timeout(limit, call).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ExecutionFault::rejected(phase, name)),
            Ok(Err(e)) => Err(ExecutionFault::new(phase, format!("{name} failed: {e}"))),
            Err(_) => Err(ExecutionFault::timeout(phase, name, limit)),
        }
    }

    fn last_position(&self) -> Option<GeoPosition> {
        self.last.lock().as_ref().map(|t| t.position)
    }

    /// Poll telemetry once and forward it as progress along `leg`
    async fn poll(&self, leg: Option<&Leg>, progress: &ProgressTx) {
        let sample = match timeout(self.timeouts.action, self.driver.telemetry()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(error = %e, "Telemetry poll failed");
                self.report_link_loss(progress).await;
                return;
            }
            Err(_) => {
                warn!("Telemetry poll timed out");
                self.report_link_loss(progress).await;
                return;
            }
        };

        let signals = self
            .latch
            .lock()
            .update(!sample.gps_fix, !sample.link_ok, sample.obstacle);
        if let Some(detection) = &sample.detection {
            *self.detection.lock() = Some(detection.clone());
        }

        let fraction = match leg {
            Some(leg) => {
                let total = leg.length_m();
                let remaining = Leg::new(leg.kind, sample.position, leg.to).length_m();
                if total > 0.0 {
                    (1.0 - remaining / total).clamp(0.0, 1.0)
                } else {
                    1.0
                }
            }
            None => 0.0,
        };

        let _ = progress
            .send(Progress {
                position: sample.position,
                heading: sample.heading,
                speed: sample.speed,
                battery: sample.battery,
                fraction,
                signals,
            })
            .await;
        *self.last.lock() = Some(sample);
    }

    async fn report_link_loss(&self, progress: &ProgressTx) {
        let signals = {
            let mut latch = self.latch.lock();
            let (gps_lost, obstacle) = (latch.gps_lost, latch.obstacle);
            latch.update(gps_lost, true, obstacle)
        };
        let Some(last) = self.last.lock().clone() else {
            return;
        };
        let _ = progress
            .send(Progress {
                position: last.position,
                heading: last.heading,
                speed: last.speed,
                battery: last.battery,
                fraction: 0.0,
                signals,
            })
            .await;
    }
}

#[async_trait]
impl ExecutionBackend for VehicleBackend {
    fn name(&self) -> &'static str {
        "vehicle"
    }

    async fn connect(&self) -> Result<Connected, ConnectionError> {
        let limit = self.timeouts.connect;
        match timeout(limit, self.driver.connect()).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(ConnectionError::Rejected("vehicle refused the session".into())),
            Ok(Err(e)) => return Err(ConnectionError::Unreachable(e.to_string())),
            Err(_) => return Err(ConnectionError::Timeout(limit)),
        }

        let sample = match timeout(limit, self.driver.telemetry()).await {
            Ok(Ok(sample)) => Some(sample),
            _ => None,
        };
        let connected = Connected {
            home: sample.as_ref().map(|s| s.position),
            battery: sample.as_ref().map(|s| s.battery),
        };
        *self.last.lock() = sample;

        info!(home = ?connected.home, "🛰️ Vehicle connected");
        Ok(connected)
    }

    async fn takeoff(&self, target_altitude: f64, progress: &ProgressTx) -> Result<Reached, ExecutionFault> {
        self.command(
            FaultPhase::Takeoff,
            "take_off",
            self.timeouts.takeoff,
            self.driver.take_off(target_altitude),
        )
        .await?;
        self.poll(None, progress).await;

        let position = self
            .last_position()
            .map(|p| p.with_altitude(target_altitude))
            .unwrap_or_default();
        Ok(Reached { position })
    }

    async fn move_to(&self, leg: &Leg, progress: &ProgressTx) -> Result<Reached, ExecutionFault> {
        if leg.is_degenerate() {
            return Ok(Reached { position: leg.to });
        }

        let limit = self.timeouts.leg(leg.length_m(), self.speed_mps);
        let target = DriverTarget::from_position(&leg.to);
        let mut held = self.held.subscribe();
        let mut ticker = self.ticker.lock().await;
        let mut active = Duration::ZERO;

        loop {
            let paused = *held.borrow_and_update();
            if paused {
                let released = held.wait_for(|held| !*held).await.is_ok();
                if !released {
                    return Err(ExecutionFault::new(FaultPhase::Navigate, "hold signal lost"));
                }
                ticker.reset();
            }

            let started = Instant::now();
            let command = self.driver.move_to(target, self.speed_mps);
            tokio::pin!(command);

            let outcome = loop {
                tokio::select! {
                    biased;
                    result = &mut command => break Some(result),
                    changed = held.changed() => {
                        if changed.is_err() {
                            return Err(ExecutionFault::new(FaultPhase::Navigate, "hold signal lost"));
                        }
                        let now_held = *held.borrow_and_update();
                        if now_held {
                            break None;
                        }
                    }
                    _ = ticker.tick() => {
                        if active + started.elapsed() > limit {
                            return Err(ExecutionFault::timeout(FaultPhase::Navigate, "move_to", limit));
                        }
                        self.poll(Some(leg), progress).await;
                    }
                }
            };
            active += started.elapsed();

            match outcome {
                Some(Ok(true)) => {
                    self.poll(Some(leg), progress).await;
                    return Ok(Reached { position: leg.to });
                }
                Some(Ok(false)) => return Err(ExecutionFault::rejected(FaultPhase::Navigate, "move_to")),
                Some(Err(e)) => {
                    return Err(ExecutionFault::new(FaultPhase::Navigate, format!("move_to failed: {e}")));
                }
                // Held: the in-flight command is dropped and re-issued on release
                None => debug!("move_to suspended by hold"),
            }
        }
    }

    async fn perform_action(
        &self,
        action: WaypointAction,
        hover: Duration,
        progress: &ProgressTx,
    ) -> Result<Done, ExecutionFault> {
        let phase = FaultPhase::Action;
        match action {
            WaypointAction::Photo => {
                self.command(phase, "take_photo", self.timeouts.action, self.driver.take_photo())
                    .await?
            }
            WaypointAction::VideoStart => {
                self.command(phase, "start_recording", self.timeouts.action, self.driver.start_recording())
                    .await?
            }
            WaypointAction::VideoStop => {
                self.command(phase, "stop_recording", self.timeouts.action, self.driver.stop_recording())
                    .await?
            }
            WaypointAction::Hover => {
                self.command(phase, "hold_position", self.timeouts.action, self.driver.hold_position())
                    .await?;
                tokio::time::sleep(hover).await;
            }
            WaypointAction::Scan => {
                let orbit = hover.max(Duration::from_secs(SCAN_SECS));
                self.command(
                    phase,
                    "circle",
                    self.timeouts.action_with_hover(orbit),
                    self.driver.circle(orbit),
                )
                .await?
            }
        }

        self.poll(None, progress).await;
        Ok(Done { action })
    }

    async fn land(&self, progress: &ProgressTx) -> Result<Landed, ExecutionFault> {
        self.command(FaultPhase::Land, "land", self.timeouts.land, self.driver.land())
            .await?;
        self.poll(None, progress).await;

        let position = self
            .last_position()
            .map(|p| p.with_altitude(0.0))
            .unwrap_or_default();
        Ok(Landed { position })
    }

    async fn abort(&self) -> Result<Landed, ExecutionFault> {
        warn!("🛑 Commanding emergency landing");
        self.command(
            FaultPhase::Abort,
            "emergency_land",
            self.timeouts.abort,
            self.driver.emergency_land(),
        )
        .await?;

        let position = self
            .last_position()
            .map(|p| p.with_altitude(0.0))
            .unwrap_or_default();
        Ok(Landed { position })
    }

    async fn hold(&self) -> Result<(), ExecutionFault> {
        self.held.send_replace(true);
        self.command(
            FaultPhase::Navigate,
            "hold_position",
            self.timeouts.action,
            self.driver.hold_position(),
        )
        .await
    }

    async fn release(&self) -> Result<(), ExecutionFault> {
        self.held.send_replace(false);
        Ok(())
    }

    fn detect_anomaly(&self) -> Option<AnomalyReport> {
        self.detection
            .lock()
            .take()
            .map(|description| AnomalyReport::new(ApprovalKind::Anomaly, description))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.driver.disconnect().await {
            warn!(error = %e, "Vehicle disconnect failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::LegKind;
    use crate::ticker::ManualTicker;
    use mockall::predicate::eq;
    use tokio::sync::mpsc;

    fn telemetry(position: GeoPosition) -> DriverTelemetry {
        DriverTelemetry {
            position,
            battery: 87.0,
            speed: 0.0,
            heading: 0.0,
            gps_fix: true,
            link_ok: true,
            obstacle: false,
            detection: None,
        }
    }

    fn backend(driver: MockVehicleDriver) -> VehicleBackend {
        let (ticker, _handle) = ManualTicker::new();
        VehicleBackend::new(Arc::new(driver), BackendTimeouts::default(), 10.0, Box::new(ticker))
    }

    fn leg() -> Leg {
        Leg::new(
            LegKind::Transit { to: 1 },
            GeoPosition::new(49.588, 22.676, 100.0),
            GeoPosition::new(49.576, 22.651, 100.0),
        )
    }

    #[test]
    fn test_driver_target_convention() {
        let position = GeoPosition::new(49.123456789012345, 22.987654321098765, 118.25);
        let target = DriverTarget::from_position(&position);

        assert_eq!(target.as_array(), [position.longitude, position.latitude, 118.25]);
        let back = target.to_position();
        assert_eq!(back.latitude.to_bits(), position.latitude.to_bits());
        assert_eq!(back.longitude.to_bits(), position.longitude.to_bits());
    }

    #[test]
    fn test_signal_latch_reports_onset_once() {
        let mut latch = SignalLatch::default();
        assert_eq!(latch.update(true, false, false), vec![Signal::GpsLost]);
        assert!(latch.update(true, false, false).is_empty());
        assert!(latch.update(false, false, false).is_empty());
        assert_eq!(latch.update(true, true, true), vec![Signal::GpsLost, Signal::LinkLost, Signal::Obstacle]);
    }

    #[tokio::test]
    async fn test_connect_reads_home_from_telemetry() {
        let home = GeoPosition::new(49.588, 22.676, 0.0);
        let mut driver = MockVehicleDriver::new();
        driver.expect_connect().times(1).returning(|| Ok(true));
        driver.expect_telemetry().returning(move || Ok(telemetry(home)));

        let connected = backend(driver).connect().await.unwrap();
        assert_eq!(connected.home, Some(home));
        assert_eq!(connected.battery, Some(87.0));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut driver = MockVehicleDriver::new();
        driver.expect_connect().returning(|| Ok(false));

        let err = backend(driver).connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_move_to_sends_target_and_speed() {
        let expected = DriverTarget::from_position(&leg().to);
        let mut driver = MockVehicleDriver::new();
        driver
            .expect_move_to()
            .with(eq(expected), eq(10.0))
            .times(1)
            .returning(|_, _| Ok(true));
        driver.expect_telemetry().returning(|| Ok(telemetry(leg().to)));

        let (tx, mut rx) = mpsc::channel(8);
        let reached = backend(driver).move_to(&leg(), &tx).await.unwrap();

        assert_eq!(reached.position, leg().to);
        assert_eq!(rx.recv().await.unwrap().fraction, 1.0);
    }

    #[tokio::test]
    async fn test_move_to_rejected() {
        let mut driver = MockVehicleDriver::new();
        driver.expect_move_to().returning(|_, _| Ok(false));

        let (tx, _rx) = mpsc::channel(8);
        let fault = backend(driver).move_to(&leg(), &tx).await.unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Navigate);
        assert!(fault.cause.contains("move_to"));
    }

    #[tokio::test]
    async fn test_action_failure_is_ancillary() {
        let mut driver = MockVehicleDriver::new();
        driver
            .expect_take_photo()
            .returning(|| Err(DriverError::Link("gimbal offline".into())));

        let (tx, _rx) = mpsc::channel(8);
        let fault = backend(driver)
            .perform_action(WaypointAction::Photo, Duration::ZERO, &tx)
            .await
            .unwrap_err();

        assert!(fault.is_ancillary());
        assert_eq!(fault.cause, "take_photo failed: Link error: gimbal offline");
    }

    #[tokio::test]
    async fn test_abort_commands_emergency_landing() {
        let mut driver = MockVehicleDriver::new();
        driver.expect_emergency_land().times(1).returning(|| Ok(true));

        let landed = backend(driver).abort().await.unwrap();
        assert_eq!(landed.position.altitude, 0.0);
    }

    #[tokio::test]
    async fn test_detection_becomes_anomaly_once() {
        let mut driver = MockVehicleDriver::new();
        driver.expect_take_photo().returning(|| Ok(true));
        driver.expect_telemetry().returning(|| {
            let mut sample = telemetry(GeoPosition::new(49.58, 22.66, 100.0));
            sample.detection = Some("Vehicle on restricted road".into());
            Ok(sample)
        });

        let backend = backend(driver);
        let (tx, _rx) = mpsc::channel(8);
        backend
            .perform_action(WaypointAction::Photo, Duration::ZERO, &tx)
            .await
            .unwrap();

        let report = backend.detect_anomaly().unwrap();
        assert_eq!(report.kind, ApprovalKind::Anomaly);
        assert!(backend.detect_anomaly().is_none());
    }

    /// Driver whose navigation never completes
    struct StalledDriver;

    #[async_trait]
    impl VehicleDriver for StalledDriver {
        async fn connect(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn disconnect(&self) -> DriverResult<()> {
            Ok(())
        }
        async fn take_off(&self, _altitude: f64) -> DriverResult<bool> {
            Ok(true)
        }
        async fn move_to(&self, _target: DriverTarget, _max_speed: f64) -> DriverResult<bool> {
            std::future::pending().await
        }
        async fn hold_position(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn take_photo(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn start_recording(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn stop_recording(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn circle(&self, _duration: Duration) -> DriverResult<bool> {
            Ok(true)
        }
        async fn land(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn emergency_land(&self) -> DriverResult<bool> {
            Ok(true)
        }
        async fn telemetry(&self) -> DriverResult<DriverTelemetry> {
            Ok(telemetry(GeoPosition::new(49.588, 22.676, 100.0)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_move_to_times_out() {
        let backend = VehicleBackend::new(
            Arc::new(StalledDriver),
            BackendTimeouts::default(),
            10.0,
            Box::new(IntervalTicker::new(Duration::from_secs(1))),
        );
        let (tx, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let fault = backend.move_to(&leg(), &tx).await.unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Navigate);
        assert!(fault.cause.contains("timed out"));

        drop(tx);
        drain.await.unwrap();
    }
}
