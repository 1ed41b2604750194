//! Software stand-in vehicle.
//!
//! Position advances a fixed fraction of the current leg per tick and the
//! battery drains a fixed amount per tick. A [`FaultInjector`] can fail any
//! operation or raise signals at chosen points for deterministic tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mission_core::{ApprovalKind, GeoPosition, MissionPlaybook, WaypointAction};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::{
    AnomalyReport, Connected, Done, ExecutionBackend, Landed, Progress, ProgressTx, Reached, Signal,
};
use crate::config::{BackendTimeouts, EngineConfig, SimulationConfig};
use crate::error::{ConnectionError, ExecutionFault, FaultPhase};
use crate::navigator::{Leg, WaypointNavigator};
use crate::ticker::{IntervalTicker, Ticker};

/// Minimum simulated duration of a scan
const SCAN_SECS: u64 = 10;

const ANOMALIES: [(ApprovalKind, &str); 3] = [
    (ApprovalKind::Anomaly, "Unidentified vehicle detected near the route"),
    (ApprovalKind::Deviation, "Route obstructed, deviation proposed"),
    (ApprovalKind::HighRisk, "People detected below the flight path"),
];

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Point in the simulation where a fault can be injected
#[derive(Debug, Clone, Copy)]
pub enum InjectionPoint<'a> {
    Connect,
    Takeoff,
    /// Before each navigation tick, with the fraction covered so far
    Tick { leg: &'a Leg, fraction: f64 },
    Action(WaypointAction),
    Land,
}

/// What an injector does at a matching point
#[derive(Debug, Clone, PartialEq)]
pub enum Injection {
    /// Fail the operation with this cause
    Fail(String),
    /// Attach a signal to the next progress sample
    Signal(Signal),
    /// Report an anomaly on the next detection check
    Anomaly(AnomalyReport),
}

pub trait FaultInjector: Send + Sync {
    fn inject(&self, point: &InjectionPoint<'_>) -> Option<Injection>;
}

/// When a [`FaultPlan`] rule fires
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultTrigger {
    Connect,
    Takeoff,
    Land,
    Action(WaypointAction),
    /// While flying towards waypoint `target`, once `after_fraction` is covered
    MoveTo { target: usize, after_fraction: f64 },
    /// While returning home, once `after_fraction` is covered
    ReturnHome { after_fraction: f64 },
    /// While flying any detour, once `after_fraction` is covered
    Detour { after_fraction: f64 },
}

#[derive(Debug)]
struct FaultRule {
    trigger: FaultTrigger,
    injection: Injection,
    remaining: AtomicU32,
}

impl FaultRule {
    fn matches(&self, point: &InjectionPoint<'_>) -> bool {
        use crate::navigator::LegKind;

        match (self.trigger, point) {
            (FaultTrigger::Connect, InjectionPoint::Connect)
            | (FaultTrigger::Takeoff, InjectionPoint::Takeoff)
            | (FaultTrigger::Land, InjectionPoint::Land) => true,
            (FaultTrigger::Action(expected), InjectionPoint::Action(action)) => expected == *action,
            (FaultTrigger::MoveTo { target, after_fraction }, InjectionPoint::Tick { leg, fraction }) => {
                leg.kind != LegKind::ReturnHome
                    && leg.arrival_index() == Some(target)
                    && *fraction >= after_fraction
            }
            (FaultTrigger::ReturnHome { after_fraction }, InjectionPoint::Tick { leg, fraction }) => {
                leg.kind == LegKind::ReturnHome && *fraction >= after_fraction
            }
            (FaultTrigger::Detour { after_fraction }, InjectionPoint::Tick { leg, fraction }) => {
                matches!(leg.kind, LegKind::Detour { .. }) && *fraction >= after_fraction
            }
            _ => false,
        }
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
    }
}

/// Declarative list of one-shot (or n-shot) injections
#[derive(Debug, Default)]
pub struct FaultPlan {
    rules: Vec<FaultRule>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, trigger: FaultTrigger, injection: Injection) -> Self {
        self.on_times(trigger, injection, 1)
    }

    pub fn on_times(mut self, trigger: FaultTrigger, injection: Injection, times: u32) -> Self {
        self.rules.push(FaultRule {
            trigger,
            injection,
            remaining: AtomicU32::new(times),
        });
        self
    }

    /// Fail the leg towards `target` halfway through
    pub fn fail_move_to(target: usize, cause: impl Into<String>) -> Self {
        Self::new().on(
            FaultTrigger::MoveTo {
                target,
                after_fraction: 0.5,
            },
            Injection::Fail(cause.into()),
        )
    }
}

impl FaultInjector for FaultPlan {
    fn inject(&self, point: &InjectionPoint<'_>) -> Option<Injection> {
        self.rules
            .iter()
            .find(|rule| rule.matches(point) && rule.take())
            .map(|rule| rule.injection.clone())
    }
}

// ============================================================================
// OPERATION BUDGET
// ============================================================================

/// Time allowance of one operation; held time is added back on release
#[derive(Debug)]
struct Budget {
    phase: FaultPhase,
    command: String,
    limit: Duration,
    deadline: Option<Instant>,
}

impl Budget {
    fn new(phase: FaultPhase, command: impl Into<String>, limit: Duration) -> Self {
        Self {
            phase,
            command: command.into(),
            limit,
            deadline: Instant::now().checked_add(limit),
        }
    }

    fn unbounded(phase: FaultPhase) -> Self {
        Self {
            phase,
            command: phase.to_string(),
            limit: Duration::MAX,
            deadline: None,
        }
    }

    fn extend(&mut self, by: Duration) {
        self.deadline = self.deadline.and_then(|deadline| deadline.checked_add(by));
    }

    fn expired(&self) -> ExecutionFault {
        ExecutionFault::timeout(self.phase, &self.command, self.limit)
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// SIMULATED BACKEND
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct SimVehicle {
    position: GeoPosition,
    battery: f64,
    heading: f64,
}

pub struct SimulatedBackend {
    config: SimulationConfig,
    timeouts: BackendTimeouts,
    speed_mps: f64,
    home: Option<GeoPosition>,
    vehicle: Mutex<SimVehicle>,
    ticker: tokio::sync::Mutex<Box<dyn Ticker>>,
    held: watch::Sender<bool>,
    connected: AtomicBool,
    aborted: AtomicBool,
    abort_calls: AtomicUsize,
    rng: Mutex<StdRng>,
    pending_anomaly: Mutex<Option<AnomalyReport>>,
    faults: Option<Arc<dyn FaultInjector>>,
}

impl SimulatedBackend {
    pub fn new(config: SimulationConfig, ticker: Box<dyn Ticker>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            config,
            timeouts: BackendTimeouts::default(),
            speed_mps: 10.0,
            home: None,
            vehicle: Mutex::new(SimVehicle {
                position: GeoPosition::default(),
                battery: 100.0,
                heading: 0.0,
            }),
            ticker: tokio::sync::Mutex::new(ticker),
            held: watch::Sender::new(false),
            connected: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_calls: AtomicUsize::new(0),
            rng: Mutex::new(rng),
            pending_anomaly: Mutex::new(None),
            faults: None,
        }
    }

    /// Backend parked on the ground below the playbook's first waypoint
    pub fn from_config(playbook: &MissionPlaybook, config: &EngineConfig) -> Self {
        let ticker = Box::new(IntervalTicker::new(config.tick_interval));
        let mut backend = Self::new(config.simulation.clone(), ticker)
            .with_speed(playbook.flight_parameters.speed_mps)
            .with_timeouts(config.timeouts.clone());
        if let Some(first) = playbook.waypoints.first() {
            backend = backend.with_home(first.position().with_altitude(0.0));
        }
        backend
    }

    pub fn with_home(mut self, home: GeoPosition) -> Self {
        self.home = Some(home);
        self.vehicle.get_mut().position = home;
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = speed_mps;
        self
    }

    pub fn with_timeouts(mut self, timeouts: BackendTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Number of times `abort()` has been called
    pub fn abort_count(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    pub fn position(&self) -> GeoPosition {
        self.vehicle.lock().position
    }

    pub fn battery(&self) -> f64 {
        self.vehicle.lock().battery
    }

    fn inject(&self, point: InjectionPoint<'_>) -> Option<Injection> {
        self.faults.as_ref()?.inject(&point)
    }

    /// Apply an injection at a non-tick point; only failures and anomalies apply
    fn check_fault(&self, point: InjectionPoint<'_>, phase: FaultPhase) -> Result<(), ExecutionFault> {
        match self.inject(point) {
            Some(Injection::Fail(cause)) => Err(ExecutionFault::new(phase, cause)),
            Some(Injection::Anomaly(report)) => {
                *self.pending_anomaly.lock() = Some(report);
                Ok(())
            }
            Some(Injection::Signal(_)) | None => Ok(()),
        }
    }

    fn ensure_active(&self, phase: FaultPhase) -> Result<(), ExecutionFault> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(ExecutionFault::new(phase, "operation interrupted by abort"))
        } else {
            Ok(())
        }
    }

    /// Update the vehicle and build a progress sample from it
    fn step(&self, position: GeoPosition, heading: f64, drain: f64) -> SimVehicle {
        let mut vehicle = self.vehicle.lock();
        vehicle.position = position;
        vehicle.heading = heading;
        vehicle.battery = (vehicle.battery - drain).max(0.0);
        *vehicle
    }

    async fn report(progress: &ProgressTx, vehicle: SimVehicle, speed: f64, fraction: f64, signals: Vec<Signal>) {
        let sample = Progress {
            position: vehicle.position,
            heading: vehicle.heading,
            speed,
            battery: vehicle.battery,
            fraction,
            signals,
        };
        // A closed receiver means nobody is watching; the vehicle keeps flying
        let _ = progress.send(sample).await;
    }

    /// Wait for the next tick of an operation, sitting out any hold.
    ///
    /// The ticker restarts on release and held time is not charged to `budget`.
    async fn paced_tick(
        ticker: &mut Box<dyn Ticker>,
        held: &mut watch::Receiver<bool>,
        budget: &mut Budget,
    ) -> Result<(), ExecutionFault> {
        loop {
            if *held.borrow_and_update() {
                let since = Instant::now();
                if held.wait_for(|held| !*held).await.is_err() {
                    return Err(ExecutionFault::new(budget.phase, "hold signal lost"));
                }
                budget.extend(since.elapsed());
                ticker.reset();
            }

            let deadline = budget.deadline;
            tokio::select! {
                biased;
                _ = held.changed() => continue,
                _ = ticker.tick() => return Ok(()),
                _ = expiry(deadline) => return Err(budget.expired()),
            }
        }
    }

    /// Change altitude over a fixed number of ticks
    async fn vertical(
        &self,
        target_altitude: f64,
        ticks: u32,
        mut budget: Budget,
        progress: &ProgressTx,
    ) -> Result<GeoPosition, ExecutionFault> {
        let start = self.position();
        let target = start.with_altitude(target_altitude);
        let ticks = ticks.max(1);
        let mut held = self.held.subscribe();
        let mut ticker = self.ticker.lock().await;

        for i in 1..=ticks {
            Self::paced_tick(&mut ticker, &mut held, &mut budget).await?;
            self.ensure_active(budget.phase)?;

            let fraction = f64::from(i) / f64::from(ticks);
            let heading = self.vehicle.lock().heading;
            let vehicle = self.step(start.interpolate(&target, fraction), heading, self.config.idle_drain_per_tick);
            Self::report(progress, vehicle, 0.0, fraction, Vec::new()).await;
        }

        Ok(target)
    }

    fn steps_per_leg(&self) -> u32 {
        let per_tick = self.config.progress_per_tick.clamp(f64::EPSILON, 1.0);
        ((1.0 / per_tick) - 1e-9).ceil().max(1.0) as u32
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn connect(&self) -> Result<Connected, ConnectionError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(Connected {
                home: self.home,
                battery: Some(self.battery()),
            });
        }

        if let Some(Injection::Fail(cause)) = self.inject(InjectionPoint::Connect) {
            warn!(cause = %cause, "Simulated connection failure");
            return Err(ConnectionError::Unreachable(cause));
        }

        self.connected.store(true, Ordering::SeqCst);
        info!("🛰️ Simulated vehicle connected");
        Ok(Connected {
            home: self.home,
            battery: Some(self.battery()),
        })
    }

    async fn takeoff(&self, target_altitude: f64, progress: &ProgressTx) -> Result<Reached, ExecutionFault> {
        self.check_fault(InjectionPoint::Takeoff, FaultPhase::Takeoff)?;

        let budget = Budget::new(FaultPhase::Takeoff, "takeoff", self.timeouts.takeoff);
        let position = self
            .vertical(target_altitude, self.config.takeoff_ticks, budget, progress)
            .await?;

        debug!(altitude = target_altitude, "Simulated takeoff complete");
        Ok(Reached { position })
    }

    async fn move_to(&self, leg: &Leg, progress: &ProgressTx) -> Result<Reached, ExecutionFault> {
        self.ensure_active(FaultPhase::Navigate)?;

        if leg.is_degenerate() {
            let heading = self.vehicle.lock().heading;
            let vehicle = self.step(leg.to, heading, 0.0);
            Self::report(progress, vehicle, 0.0, 1.0, Vec::new()).await;
            return Ok(Reached { position: leg.to });
        }

        let steps = self.steps_per_leg();
        let mut step = 0u32;
        let mut budget = Budget::unbounded(FaultPhase::Navigate);
        let mut held = self.held.subscribe();
        let mut ticker = self.ticker.lock().await;

        loop {
            Self::paced_tick(&mut ticker, &mut held, &mut budget).await?;
            self.ensure_active(FaultPhase::Navigate)?;

            let covered = f64::from(step) / f64::from(steps);
            let mut signals = Vec::new();
            match self.inject(InjectionPoint::Tick { leg, fraction: covered }) {
                Some(Injection::Fail(cause)) => {
                    return Err(ExecutionFault::new(FaultPhase::Navigate, cause));
                }
                Some(Injection::Signal(signal)) => signals.push(signal),
                Some(Injection::Anomaly(report)) => *self.pending_anomaly.lock() = Some(report),
                None => {}
            }

            step += 1;
            let fraction = f64::from(step) / f64::from(steps);
            let fix = WaypointNavigator::fix(leg, fraction);
            let vehicle = self.step(fix.position, fix.heading, self.config.drain_per_tick);
            Self::report(progress, vehicle, self.speed_mps, fraction, signals).await;

            if step >= steps {
                return Ok(Reached { position: leg.to });
            }
        }
    }

    async fn perform_action(
        &self,
        action: WaypointAction,
        hover: Duration,
        progress: &ProgressTx,
    ) -> Result<Done, ExecutionFault> {
        self.ensure_active(FaultPhase::Action)?;
        self.check_fault(InjectionPoint::Action(action), FaultPhase::Action)?;

        let stationary = match action {
            WaypointAction::Hover => hover,
            WaypointAction::Scan => hover.max(Duration::from_secs(SCAN_SECS)),
            _ => Duration::ZERO,
        };
        let per_tick = self.config.seconds_per_tick.max(f64::EPSILON);
        let ticks = (stationary.as_secs_f64() / per_tick).ceil() as u32;

        let mut budget = Budget::new(
            FaultPhase::Action,
            action.to_string(),
            self.timeouts.action_with_hover(stationary),
        );
        let mut held = self.held.subscribe();
        let mut ticker = self.ticker.lock().await;
        for i in 1..=ticks {
            Self::paced_tick(&mut ticker, &mut held, &mut budget).await?;
            self.ensure_active(FaultPhase::Action)?;
            let (position, heading) = {
                let vehicle = self.vehicle.lock();
                (vehicle.position, vehicle.heading)
            };
            let vehicle = self.step(position, heading, self.config.idle_drain_per_tick);
            Self::report(progress, vehicle, 0.0, f64::from(i) / f64::from(ticks), Vec::new()).await;
        }

        debug!(%action, "Simulated action complete");
        Ok(Done { action })
    }

    async fn land(&self, progress: &ProgressTx) -> Result<Landed, ExecutionFault> {
        self.check_fault(InjectionPoint::Land, FaultPhase::Land)?;

        let budget = Budget::new(FaultPhase::Land, "land", self.timeouts.land);
        let position = self
            .vertical(0.0, self.config.landing_ticks, budget, progress)
            .await?;

        Ok(Landed { position })
    }

    async fn abort(&self) -> Result<Landed, ExecutionFault> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);

        let mut vehicle = self.vehicle.lock();
        vehicle.position.altitude = 0.0;
        warn!(position = ?vehicle.position, "🛑 Simulated emergency landing");
        Ok(Landed {
            position: vehicle.position,
        })
    }

    async fn hold(&self) -> Result<(), ExecutionFault> {
        self.held.send_replace(true);
        Ok(())
    }

    async fn release(&self) -> Result<(), ExecutionFault> {
        self.held.send_replace(false);
        Ok(())
    }

    fn detect_anomaly(&self) -> Option<AnomalyReport> {
        if let Some(report) = self.pending_anomaly.lock().take() {
            return Some(report);
        }

        let probability = self.config.approval_probability.clamp(0.0, 1.0);
        if probability <= 0.0 {
            return None;
        }

        let mut rng = self.rng.lock();
        if !rng.random_bool(probability) {
            return None;
        }
        let (kind, description) = ANOMALIES[rng.random_range(0..ANOMALIES.len())];
        Some(AnomalyReport::new(kind, description))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("Simulated vehicle disconnected");
    }
}

// ============================================================================
// TESTS
// ============================================================================
