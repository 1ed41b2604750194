//! Mission runner task.
//!
//! One runner drives one mission from takeoff to a terminal phase. It owns
//! the state machine, the approval gate and the contingency handler, and
//! multiplexes operator control messages, backend progress and the approval
//! deadline while a backend operation is in flight.

use std::future::Future;
use std::sync::Arc;

use mission_core::{
    Approval, ApprovalKind, CoreError, CoreResult, Decision, GeoPosition, HumanDecision,
    MissionPlaybook, MissionStatus, WarningLevel,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::approval::{ApprovalGate, Resolution};
use crate::backend::{ExecutionBackend, Progress, ProgressTx};
use crate::config::{ApprovalTrigger, EngineConfig};
use crate::contingency::{ContingencyHandler, LateralOffsetReroute, RerouteHook, Remedy, TickContext};
use crate::error::ExecutionFault;
use crate::machine::MissionStateMachine;
use crate::navigator::{Advance, Leg, LegKind, RoutePolicy, WaypointNavigator};

const PROGRESS_CAPACITY: usize = 64;

/// Operator command delivered to a running mission
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Abort,
    Decision(HumanDecision),
}

/// Control message with a reply slot
#[derive(Debug)]
pub struct Control {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<CoreResult<()>>,
}

impl Control {
    pub fn new(command: ControlCommand) -> (Self, oneshot::Receiver<CoreResult<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }
}

pub type ControlTx = mpsc::Sender<Control>;

/// Change of plan raised while an operation was in flight
#[derive(Debug, Clone, PartialEq)]
enum Redirect {
    ReturnHome { reason: String, ends_as: MissionStatus },
    Land { reason: String },
    Detour { via: GeoPosition },
}

/// Reason the mission must stop now
#[derive(Debug, Clone, PartialEq)]
enum Stop {
    Abort { reason: String },
    Fail { cause: String },
}

impl From<CoreError> for Stop {
    fn from(e: CoreError) -> Self {
        Stop::Fail { cause: e.to_string() }
    }
}

impl From<ExecutionFault> for Stop {
    fn from(fault: ExecutionFault) -> Self {
        Stop::Fail {
            cause: fault.to_string(),
        }
    }
}

/// Outcome of a driven backend operation
enum Flow<T> {
    Done(Result<T, ExecutionFault>),
    Redirect(Redirect),
}

pub struct MissionRunner {
    playbook: Arc<MissionPlaybook>,
    config: Arc<EngineConfig>,
    backend: Arc<dyn ExecutionBackend>,
    navigator: WaypointNavigator,
    machine: MissionStateMachine,
    gate: ApprovalGate,
    contingency: ContingencyHandler,
    control_rx: mpsc::Receiver<Control>,
    progress_tx: ProgressTx,
    progress_rx: mpsc::Receiver<Progress>,
    home: GeoPosition,
    current_leg: Option<Leg>,
    started_at: Instant,
    paused: bool,
    held: bool,
    end_status: MissionStatus,
}

impl MissionRunner {
    pub fn new(
        playbook: Arc<MissionPlaybook>,
        config: Arc<EngineConfig>,
        backend: Arc<dyn ExecutionBackend>,
        machine: MissionStateMachine,
        control_rx: mpsc::Receiver<Control>,
    ) -> Self {
        let policy = config
            .route_policy_override
            .unwrap_or_else(|| RoutePolicy::for_kind(playbook.mission_type));
        let navigator = WaypointNavigator::new(playbook.waypoints.clone(), policy);
        let gate = ApprovalGate::new(machine.state().mission_id.clone(), config.approval.clone());
        let contingency = ContingencyHandler::new(
            &playbook.contingencies,
            config.battery_reserve_pct,
            playbook.max_duration(),
            policy == RoutePolicy::Loop,
        )
        .with_reroute(Arc::new(LateralOffsetReroute::default()));
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CAPACITY);
        let home = machine.position();

        Self {
            playbook,
            config,
            backend,
            navigator,
            machine,
            gate,
            contingency,
            control_rx,
            progress_tx,
            progress_rx,
            home,
            current_leg: None,
            started_at: Instant::now(),
            paused: false,
            held: false,
            end_status: MissionStatus::Completed,
        }
    }

    pub fn with_reroute(mut self, hook: Arc<dyn RerouteHook>) -> Self {
        self.contingency = self.contingency.with_reroute(hook);
        self
    }

    /// Drive the mission to a terminal phase and return it
    pub async fn run(mut self) -> MissionStatus {
        info!(
            mission_id = %self.playbook.mission_id,
            backend = self.backend.name(),
            waypoints = self.navigator.len(),
            policy = ?self.navigator.policy(),
            "🚀 Mission runner started"
        );

        if let Err(stop) = self.execute().await {
            self.stop(stop).await;
        }

        self.gate.cancel();
        self.backend.disconnect().await;
        self.machine.phase()
    }

    // ========================================================================
    // MISSION FLOW
    // ========================================================================

    async fn execute(&mut self) -> Result<(), Stop> {
        self.started_at = Instant::now();
        self.machine.transition(MissionStatus::TakingOff)?;

        let altitude = self.navigator.takeoff_altitude();
        let backend = self.backend.clone();
        let progress = self.progress_tx.clone();
        match self
            .drive(async move { backend.takeoff(altitude, &progress).await })
            .await?
        {
            Flow::Done(result) => {
                result?;
            }
            Flow::Redirect(redirect) => return self.redirected(redirect).await,
        }

        self.machine.transition(MissionStatus::EnRoute)?;

        let Some(mut leg) = self.navigator.first_leg(self.machine.position()) else {
            return Err(Stop::Fail {
                cause: "Playbook has no waypoints".to_string(),
            });
        };

        loop {
            match self.fly(leg).await? {
                Flow::Done(result) => {
                    result?;
                }
                Flow::Redirect(Redirect::Detour { via }) => {
                    let resume_to = leg.arrival_index().unwrap_or_default();
                    self.machine
                        .warn(WarningLevel::Warning, "Obstacle on route, flying a detour");
                    leg = Leg::new(LegKind::Detour { resume_to }, self.machine.position(), via);
                    continue;
                }
                Flow::Redirect(redirect) => return self.redirected(redirect).await,
            }

            if let Some(index) = leg.arrival_index() {
                self.machine.waypoint_reached(index);
                if let Some(redirect) = self.at_waypoint(index).await? {
                    return self.redirected(redirect).await;
                }
            }

            match self.navigator.after_arrival(&leg) {
                Advance::Next(next) => leg = next,
                Advance::Complete => break,
            }
        }

        self.land_and_finish("Route complete").await
    }

    /// Fly a leg, reporting the waypoint it approaches
    async fn fly(&mut self, leg: Leg) -> Result<Flow<()>, Stop> {
        let index = self
            .navigator
            .reported_index(&leg, self.machine.state().current_waypoint_index);
        self.machine.set_target_index(index);
        self.current_leg = Some(leg);
        debug!(mission_id = %self.playbook.mission_id, kind = ?leg.kind, "Flying leg");

        let backend = self.backend.clone();
        let progress = self.progress_tx.clone();
        let mut flow = self
            .drive(async move { backend.move_to(&leg, &progress).await.map(|_| ()) })
            .await?;
        // An approval raised on the final sample is settled on this leg
        if matches!(flow, Flow::Done(Ok(()))) {
            if let Some(redirect) = self.settle_approval().await? {
                flow = Flow::Redirect(redirect);
            }
        }
        self.current_leg = None;
        Ok(flow)
    }

    /// Run the waypoint's action and any per-waypoint approval check
    async fn at_waypoint(&mut self, index: usize) -> Result<Option<Redirect>, Stop> {
        let Some(waypoint) = self.navigator.waypoint(index).cloned() else {
            return Ok(None);
        };

        if let Some(action) = waypoint.action {
            let hover = waypoint.hover_duration();
            let backend = self.backend.clone();
            let progress = self.progress_tx.clone();
            match self
                .drive(async move { backend.perform_action(action, hover, &progress).await })
                .await?
            {
                Flow::Done(Ok(_)) => {}
                Flow::Done(Err(fault)) if !self.config.action_failures_fatal => {
                    self.machine.warn(
                        WarningLevel::Warning,
                        format!("Action {action} failed at waypoint {index}: {fault}"),
                    );
                }
                Flow::Done(Err(fault)) => return Err(fault.into()),
                Flow::Redirect(Redirect::Detour { .. }) => {}
                Flow::Redirect(redirect) => return Ok(Some(redirect)),
            }
        }

        if self.gate.trigger() == ApprovalTrigger::PerWaypoint {
            if let Some(report) = self.backend.detect_anomaly() {
                self.request_approval(report.kind, report.description).await;
            }
        }

        self.settle_approval().await
    }

    async fn redirected(&mut self, redirect: Redirect) -> Result<(), Stop> {
        match redirect {
            Redirect::ReturnHome { reason, ends_as } => self.return_home(reason, ends_as).await,
            Redirect::Land { reason } => {
                self.end_status = MissionStatus::Aborted;
                self.machine.warn(WarningLevel::Critical, reason.clone());
                self.land_and_finish(&reason).await
            }
            // Detours are only raised in flight phases, which fly legs
            Redirect::Detour { .. } => Err(Stop::Fail {
                cause: "Detour requested outside a leg".to_string(),
            }),
        }
    }

    async fn return_home(&mut self, reason: String, ends_as: MissionStatus) -> Result<(), Stop> {
        if ends_as == MissionStatus::Aborted {
            self.end_status = MissionStatus::Aborted;
        }
        self.machine.warn(WarningLevel::Warning, format!("Returning home: {reason}"));
        if self.machine.phase() != MissionStatus::Returning {
            self.machine.transition(MissionStatus::Returning)?;
        }

        let mut leg = self.navigator.return_leg(self.machine.position(), self.home);
        loop {
            match self.fly(leg).await? {
                Flow::Done(result) => {
                    result?;
                    if leg.kind == LegKind::ReturnHome {
                        break;
                    }
                    leg = self.navigator.return_leg(self.machine.position(), self.home);
                }
                Flow::Redirect(Redirect::Land { reason }) => {
                    self.end_status = MissionStatus::Aborted;
                    self.machine.warn(WarningLevel::Critical, reason.clone());
                    return self.land_and_finish(&reason).await;
                }
                Flow::Redirect(Redirect::Detour { via }) => {
                    self.machine
                        .warn(WarningLevel::Warning, "Obstacle on the way home, flying a detour");
                    leg = Leg::new(LegKind::Detour { resume_to: 0 }, self.machine.position(), via);
                }
                Flow::Redirect(Redirect::ReturnHome { ends_as, .. }) => {
                    if ends_as == MissionStatus::Aborted {
                        self.end_status = MissionStatus::Aborted;
                    }
                    leg = self.navigator.return_leg(self.machine.position(), self.home);
                }
            }
        }

        self.land_and_finish(&reason).await
    }

    /// Descend and close the mission as Completed, or Aborted after a policy stop
    async fn land_and_finish(&mut self, reason: &str) -> Result<(), Stop> {
        if self.machine.phase() != MissionStatus::Landing {
            self.machine.transition(MissionStatus::Landing)?;
        }

        let backend = self.backend.clone();
        let progress = self.progress_tx.clone();
        match self.drive(async move { backend.land(&progress).await }).await? {
            Flow::Done(result) => {
                result?;
            }
            Flow::Redirect(_) => {
                return Err(Stop::Fail {
                    cause: "Landing interrupted".to_string(),
                });
            }
        }

        match self.end_status {
            MissionStatus::Aborted => {
                self.machine
                    .finish(MissionStatus::Aborted, format!("Mission aborted: {reason}"));
            }
            _ => self.machine.complete()?,
        }
        Ok(())
    }

    /// Force-land and close the mission as Aborted or Failed
    async fn stop(&mut self, stop: Stop) {
        self.gate.cancel();
        let (status, message) = match stop {
            Stop::Abort { reason } => (MissionStatus::Aborted, reason),
            Stop::Fail { cause } => (MissionStatus::Failed, cause),
        };

        let limit = self.config.timeouts.abort;
        match timeout(limit, self.backend.abort()).await {
            Ok(Ok(landed)) => {
                let position = landed.position;
                self.machine.sync_vehicle(Some(position), None);
            }
            Ok(Err(fault)) => warn!(
                mission_id = %self.playbook.mission_id,
                error = %fault,
                "Emergency landing failed"
            ),
            Err(_) => warn!(
                mission_id = %self.playbook.mission_id,
                ?limit,
                "Emergency landing timed out"
            ),
        }

        self.machine.finish(status, message);
    }

    // ========================================================================
    // EVENT MULTIPLEXING
    // ========================================================================

    /// Run `op` while serving control messages, progress and approval deadlines
    async fn drive<T, F>(&mut self, op: F) -> Result<Flow<T>, Stop>
    where
        F: Future<Output = Result<T, ExecutionFault>>,
    {
        tokio::pin!(op);

        loop {
            let deadline = self.gate.deadline();

            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => {
                    if let Some(redirect) = self.handle_control(control).await? {
                        return Ok(Flow::Redirect(redirect));
                    }
                }
                Some(sample) = self.progress_rx.recv() => {
                    if let Some(redirect) = self.on_progress(sample).await? {
                        return Ok(Flow::Redirect(redirect));
                    }
                }
                _ = wait_deadline(deadline) => {
                    if let Some(redirect) = self.expire_approval().await? {
                        return Ok(Flow::Redirect(redirect));
                    }
                }
                result = &mut op => {
                    // Samples sent just before completion still count
                    while let Ok(sample) = self.progress_rx.try_recv() {
                        if result.is_err() {
                            self.machine.apply_progress(&sample);
                        } else if let Some(redirect) = self.on_progress(sample).await? {
                            return Ok(Flow::Redirect(redirect));
                        }
                    }
                    return Ok(Flow::Done(result));
                }
            }
        }
    }

    /// Block until the outstanding approval is resolved
    async fn settle_approval(&mut self) -> Result<Option<Redirect>, Stop> {
        while self.gate.is_pending() {
            let deadline = self.gate.deadline();

            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => {
                    if let Some(redirect) = self.handle_control(control).await? {
                        return Ok(Some(redirect));
                    }
                }
                Some(sample) = self.progress_rx.recv() => {
                    self.machine.apply_progress(&sample);
                }
                _ = wait_deadline(deadline) => {
                    if let Some(redirect) = self.expire_approval().await? {
                        return Ok(Some(redirect));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn handle_control(&mut self, control: Control) -> Result<Option<Redirect>, Stop> {
        let Control { command, reply } = control;
        debug!(mission_id = %self.playbook.mission_id, ?command, "Control received");

        match command {
            ControlCommand::Pause => {
                if !self.paused {
                    self.paused = true;
                    self.machine.set_paused(true);
                    self.sync_hold().await;
                    info!(mission_id = %self.playbook.mission_id, "⏸️ Mission paused");
                }
                let _ = reply.send(Ok(()));
                Ok(None)
            }
            ControlCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    self.machine.set_paused(false);
                    self.sync_hold().await;
                    info!(mission_id = %self.playbook.mission_id, "▶️ Mission resumed");
                }
                let _ = reply.send(Ok(()));
                Ok(None)
            }
            ControlCommand::Abort => {
                let _ = reply.send(Ok(()));
                Err(Stop::Abort {
                    reason: "Aborted by operator".to_string(),
                })
            }
            ControlCommand::Decision(decision) => match self.gate.resolve(&decision) {
                Ok(resolution) => {
                    let _ = reply.send(Ok(()));
                    self.apply_resolution(resolution).await
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Ok(None)
                }
            },
        }
    }

    async fn on_progress(&mut self, sample: Progress) -> Result<Option<Redirect>, Stop> {
        self.machine.apply_progress(&sample);
        if self.gate.is_pending() {
            return Ok(None);
        }

        let state = self.machine.state();
        let remedies = self.contingency.evaluate(&TickContext {
            phase: state.phase,
            battery: state.battery,
            signals: &sample.signals,
            elapsed: self.started_at.elapsed(),
            position: state.position,
            target: self.current_leg.map(|leg| leg.to),
        });

        let mut redirect = None;
        for remedy in remedies {
            match remedy {
                Remedy::Warn { message } => self.machine.warn(WarningLevel::Warning, message),
                Remedy::Fail { cause } => return Err(Stop::Fail { cause }),
                Remedy::Abort { reason } => return Err(Stop::Abort { reason }),
                _ if redirect.is_some() || self.gate.is_pending() => {}
                Remedy::RequestApproval { kind, description } => {
                    self.request_approval(kind, description).await;
                }
                Remedy::ReturnHome { reason, ends_as } => {
                    redirect = Some(Redirect::ReturnHome { reason, ends_as });
                }
                Remedy::LandNow { reason } => redirect = Some(Redirect::Land { reason }),
                Remedy::Detour { via } => redirect = Some(Redirect::Detour { via }),
            }
        }

        if redirect.is_none()
            && !self.gate.is_pending()
            && self.gate.trigger() == ApprovalTrigger::PerTick
            && self.machine.phase() == MissionStatus::EnRoute
        {
            if let Some(report) = self.backend.detect_anomaly() {
                self.request_approval(report.kind, report.description).await;
            }
        }

        Ok(redirect)
    }

    // ========================================================================
    // APPROVALS AND HOLD
    // ========================================================================

    async fn request_approval(&mut self, kind: ApprovalKind, description: String) {
        let interrupted = self.machine.phase();
        let approval = Approval::new(self.machine.state().mission_id.clone(), kind, description)
            .at(self.machine.position());

        let approval = match self.gate.open(approval, interrupted) {
            Ok(approval) => approval.clone(),
            Err(e) => {
                debug!(mission_id = %self.playbook.mission_id, error = %e, "Approval not opened");
                return;
            }
        };

        if let Err(e) = self.machine.transition(MissionStatus::AwaitingApproval) {
            warn!(mission_id = %self.playbook.mission_id, error = %e, "Approval without phase change");
        }
        self.machine.approval_required(&approval);
        self.sync_hold().await;
    }

    async fn expire_approval(&mut self) -> Result<Option<Redirect>, Stop> {
        match self.gate.expire(Instant::now()) {
            Some(resolution) => {
                self.machine.warn(
                    WarningLevel::Warning,
                    format!(
                        "Approval {} timed out, applying {}",
                        resolution.approval.id, resolution.decision
                    ),
                );
                self.apply_resolution(resolution).await
            }
            None => Ok(None),
        }
    }

    async fn apply_resolution(&mut self, resolution: Resolution) -> Result<Option<Redirect>, Stop> {
        self.machine.approval_resolved(&resolution.as_decision());
        self.machine.transition(resolution.resume_phase)?;
        self.sync_hold().await;

        match resolution.decision {
            Decision::Approved => Ok(None),
            Decision::Denied => {
                self.end_status = MissionStatus::Aborted;
                // Already on the way home: keep flying the same leg
                if self.current_leg.map(|leg| leg.kind) == Some(LegKind::ReturnHome) {
                    return Ok(None);
                }
                Ok(Some(Redirect::ReturnHome {
                    reason: format!("approval {} denied", resolution.approval.id),
                    ends_as: MissionStatus::Aborted,
                }))
            }
        }
    }

    /// Hold the backend while paused or awaiting approval
    async fn sync_hold(&mut self) {
        let want = self.paused || self.gate.is_pending();
        if want == self.held {
            return;
        }

        let result = if want {
            self.backend.hold().await
        } else {
            self.backend.release().await
        };
        match result {
            Ok(()) => self.held = want,
            Err(fault) => warn!(
                mission_id = %self.playbook.mission_id,
                error = %fault,
                "Hold/release failed"
            ),
        }
    }
}

/// Resolves at `deadline`, or never when there is none
async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
