//! Mission registry.
//!
//! Owns every mission known to the process, keyed by [`MissionId`]. A
//! mission is created (validated) in `Planned`, started at most once, and
//! removed by [`MissionRegistry::prune_expired`] once it has been terminal
//! for longer than the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mission_core::{
    CoreError, DroneState, GeoPosition, HumanDecision, MissionId, MissionKind, MissionPlaybook,
    MissionStatus, PlaybookValidator, TelemetryEnvelope, ValidationReport, WarningLevel,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BackendFactory, Connected, ExecutionBackend};
use crate::channel::{SinkFactory, TelemetryChannel, TelemetryRelay};
use crate::config::EngineConfig;
use crate::error::{ConnectionError, EngineError, EngineResult};
use crate::machine::MissionStateMachine;
use crate::runner::{Control, ControlCommand, ControlTx, MissionRunner};

const CONTROL_CAPACITY: usize = 16;

/// Pieces handed to the runner when the mission starts
struct Launch {
    machine: MissionStateMachine,
    control_rx: mpsc::Receiver<Control>,
}

struct MissionEntry {
    playbook: Arc<MissionPlaybook>,
    report: ValidationReport,
    snapshot: watch::Receiver<DroneState>,
    channel: TelemetryChannel,
    control: ControlTx,
    launch: Mutex<Option<Launch>>,
    created_at: DateTime<Utc>,
    relay_cancel: CancellationToken,
}

impl MissionEntry {
    fn state(&self) -> DroneState {
        self.snapshot.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.snapshot.borrow().is_terminal()
    }

    fn is_running(&self) -> bool {
        self.launch.lock().is_none() && !self.is_terminal()
    }
}

/// One line of `list_missions`
#[derive(Debug, Clone, Serialize)]
pub struct MissionSummary {
    pub mission_id: MissionId,
    pub mission_type: MissionKind,
    pub phase: MissionStatus,
    pub battery: f64,
    pub current_waypoint_index: usize,
    pub total_waypoints: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registry counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct RegistryStats {
    pub missions_created: u64,
    pub missions_started: u64,
    pub missions_completed: u64,
    pub missions_aborted: u64,
    pub missions_failed: u64,
    pub missions_pruned: u64,
}

pub struct MissionRegistry {
    missions: DashMap<MissionId, Arc<MissionEntry>>,
    config: Arc<EngineConfig>,
    validator: PlaybookValidator,
    backends: Arc<dyn BackendFactory>,
    sinks: Option<Arc<dyn SinkFactory>>,
    firehose: broadcast::Sender<TelemetryEnvelope>,
    stats: Arc<RwLock<RegistryStats>>,
}

impl MissionRegistry {
    pub fn new(config: EngineConfig, backends: Arc<dyn BackendFactory>) -> Self {
        let (firehose, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            missions: DashMap::new(),
            validator: PlaybookValidator::new(config.safety.clone()),
            config: Arc::new(config),
            backends,
            sinks: None,
            firehose,
            stats: Arc::new(RwLock::new(RegistryStats::default())),
        }
    }

    /// Relay every started mission's telemetry to a sink built by `sinks`
    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validator(&self) -> &PlaybookValidator {
        &self.validator
    }

    fn entry(&self, id: &MissionId) -> EngineResult<Arc<MissionEntry>> {
        self.missions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::mission_not_found(id.as_str()).into())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Validate and register a playbook; the mission starts in `Planned`
    pub async fn create_mission(&self, mut playbook: MissionPlaybook) -> EngineResult<MissionId> {
        if playbook.mission_id.trim().is_empty() {
            playbook.mission_id = MissionId::generate().to_string();
        }
        let report = self.validator.check(&playbook)?;
        let id = MissionId::new(playbook.mission_id.clone());

        let home = playbook
            .waypoints
            .first()
            .map(|wp| wp.position().with_altitude(0.0))
            .unwrap_or_default();
        let state = DroneState::new(id.clone(), home, playbook.waypoints.len());
        let channel = TelemetryChannel::new(id.clone(), self.config.channel_capacity, self.config.history_limit)
            .with_firehose(self.firehose.clone());
        let (snapshot_tx, snapshot) = watch::channel(state.clone());
        let machine = MissionStateMachine::new(state, snapshot_tx, channel.clone());
        let (control, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        for kind in &report.defaulted {
            machine.warn(
                WarningLevel::Info,
                format!(
                    "No contingency configured for {kind}, using {}",
                    playbook.contingencies.action_for(*kind)
                ),
            );
        }

        let auto_execute = playbook.auto_execute;
        let entry = MissionEntry {
            playbook: Arc::new(playbook),
            report,
            snapshot,
            channel,
            control,
            launch: Mutex::new(Some(Launch { machine, control_rx })),
            created_at: Utc::now(),
            relay_cancel: CancellationToken::new(),
        };

        match self.missions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(CoreError::MissionAlreadyExists(id.to_string()).into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(entry));
            }
        }
        self.stats.write().missions_created += 1;
        info!(mission_id = %id, "📋 Mission created");

        if auto_execute {
            if let Err(e) = self.start_mission(&id).await {
                error!(mission_id = %id, error = %e, "Auto-execute failed to start mission");
            }
        }
        Ok(id)
    }

    /// Connect the backend and spawn the mission's runner
    pub async fn start_mission(&self, id: &MissionId) -> EngineResult<()> {
        let entry = self.entry(id)?;
        let Some(Launch { mut machine, control_rx }) = entry.launch.lock().take() else {
            return Err(CoreError::MissionAlreadyActive(id.to_string()).into());
        };

        let backend = self.backends.create(&entry.playbook, &self.config);
        let connected = match self.connect(id, backend.as_ref()).await {
            Ok(connected) => connected,
            Err(e) => {
                machine.finish(MissionStatus::Failed, format!("Connection failed: {e}"));
                self.stats.write().missions_failed += 1;
                return Err(EngineError::connection(id.as_str(), e));
            }
        };
        machine.sync_vehicle(connected.home, connected.battery);

        if let Some(sinks) = &self.sinks {
            TelemetryRelay::spawn(
                &entry.channel,
                sinks.create(id),
                self.config.relay_retry.clone(),
                entry.relay_cancel.clone(),
            );
        }

        let runner = MissionRunner::new(
            entry.playbook.clone(),
            self.config.clone(),
            backend,
            machine,
            control_rx,
        );
        let stats = self.stats.clone();
        let mission_id = id.clone();
        tokio::spawn(async move {
            let status = runner.run().await;
            let mut stats = stats.write();
            match status {
                MissionStatus::Completed => stats.missions_completed += 1,
                MissionStatus::Aborted => stats.missions_aborted += 1,
                _ => stats.missions_failed += 1,
            }
            info!(mission_id = %mission_id, %status, "Mission runner finished");
        });

        self.stats.write().missions_started += 1;
        Ok(())
    }

    async fn connect(&self, id: &MissionId, backend: &dyn ExecutionBackend) -> Result<Connected, ConnectionError> {
        let retry = &self.config.connect_retry;
        let limit = self.config.timeouts.connect;
        let mut backoff = retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match timeout(limit, backend.connect()).await {
                Ok(Ok(connected)) => return Ok(connected),
                Ok(Err(e)) => e,
                Err(_) => ConnectionError::Timeout(limit),
            };

            if attempt >= retry.max_attempts {
                return Err(ConnectionError::Exhausted {
                    attempts: attempt,
                    last: error.to_string(),
                });
            }
            let delay = backoff.next_delay().unwrap_or(retry.max);
            warn!(mission_id = %id, attempt, error = %error, ?delay, "Vehicle connection failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn pause_mission(&self, id: &MissionId) -> EngineResult<()> {
        self.control(id, ControlCommand::Pause).await
    }

    pub async fn resume_mission(&self, id: &MissionId) -> EngineResult<()> {
        self.control(id, ControlCommand::Resume).await
    }

    /// Stop a mission; idempotent on terminal missions
    pub async fn abort_mission(&self, id: &MissionId) -> EngineResult<()> {
        let entry = self.entry(id)?;

        let launch = entry.launch.lock().take();
        if let Some(Launch { mut machine, .. }) = launch {
            machine.finish(MissionStatus::Aborted, "Aborted before launch");
            self.stats.write().missions_aborted += 1;
            return Ok(());
        }
        if entry.is_terminal() {
            return Ok(());
        }

        let (control, _reply) = Control::new(ControlCommand::Abort);
        // A closed channel means the runner is already winding down
        let _ = entry.control.send(control).await;

        let mut snapshot = entry.snapshot.clone();
        let settled = timeout(self.abort_wait(), async {
            snapshot.wait_for(DroneState::is_terminal).await.is_ok()
        })
        .await;
        match settled {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::internal("runner stopped without a terminal phase").into()),
            Err(_) => Err(EngineError::AbortTimeout(id.to_string())),
        }
    }

    /// Upper bound for a running mission to reach a terminal phase after abort
    fn abort_wait(&self) -> Duration {
        let retry = &self.config.connect_retry;
        let connecting = (self.config.timeouts.connect + retry.max).saturating_mul(retry.max_attempts);
        connecting + self.config.timeouts.abort * 2
    }

    /// Deliver an operator decision to a specific mission
    pub async fn decide(&self, id: &MissionId, decision: HumanDecision) -> EngineResult<()> {
        self.control(id, ControlCommand::Decision(decision)).await
    }

    /// Deliver an operator decision to whichever mission is waiting for it
    pub async fn submit_decision(&self, decision: HumanDecision) -> EngineResult<MissionId> {
        let waiting: Vec<MissionId> = self
            .missions
            .iter()
            .filter(|e| e.snapshot.borrow().phase == MissionStatus::AwaitingApproval)
            .map(|e| e.key().clone())
            .collect();

        for id in waiting {
            match self.decide(&id, decision).await {
                Ok(()) => return Ok(id),
                Err(EngineError::Core(CoreError::ApprovalNotFound(_) | CoreError::NoPendingApproval(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::ApprovalNotFound(decision.approval_id.to_string()).into())
    }

    async fn control(&self, id: &MissionId, command: ControlCommand) -> EngineResult<()> {
        let entry = self.entry(id)?;
        if !entry.is_running() {
            return Err(CoreError::MissionNotRunning(id.to_string()).into());
        }

        let (control, reply) = Control::new(command);
        let not_running = || EngineError::from(CoreError::MissionNotRunning(id.to_string()));
        entry.control.send(control).await.map_err(|_| not_running())?;
        reply.await.map_err(|_| not_running())??;
        Ok(())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get_status(&self, id: &MissionId) -> EngineResult<DroneState> {
        Ok(self.entry(id)?.state())
    }

    /// Live snapshot feed of one mission
    pub fn watch(&self, id: &MissionId) -> EngineResult<watch::Receiver<DroneState>> {
        Ok(self.entry(id)?.snapshot.clone())
    }

    pub fn subscribe(&self, id: &MissionId) -> EngineResult<broadcast::Receiver<TelemetryEnvelope>> {
        Ok(self.entry(id)?.channel.subscribe())
    }

    /// Events from every mission
    pub fn subscribe_all(&self) -> broadcast::Receiver<TelemetryEnvelope> {
        self.firehose.subscribe()
    }

    pub fn history(&self, id: &MissionId, count: usize) -> EngineResult<Vec<TelemetryEnvelope>> {
        Ok(self.entry(id)?.channel.recent(count))
    }

    pub fn playbook(&self, id: &MissionId) -> EngineResult<Arc<MissionPlaybook>> {
        Ok(self.entry(id)?.playbook.clone())
    }

    pub fn validation_report(&self, id: &MissionId) -> EngineResult<ValidationReport> {
        Ok(self.entry(id)?.report.clone())
    }

    pub fn list_missions(&self) -> Vec<MissionSummary> {
        let mut missions: Vec<MissionSummary> = self
            .missions
            .iter()
            .map(|e| {
                let state = e.state();
                MissionSummary {
                    mission_id: e.key().clone(),
                    mission_type: e.playbook.mission_type,
                    phase: state.phase,
                    battery: state.battery,
                    current_waypoint_index: state.current_waypoint_index,
                    total_waypoints: state.total_waypoints,
                    created_at: e.created_at,
                    updated_at: state.updated_at,
                }
            })
            .collect();
        missions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        missions
    }

    /// Number of missions not yet terminal
    pub fn active_count(&self) -> usize {
        self.missions.iter().filter(|e| !e.is_terminal()).count()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Drop missions that have been terminal longer than the retention window
    pub fn prune_expired(&self) -> Vec<MissionId> {
        self.prune_expired_at(Utc::now())
    }

    pub fn prune_expired_at(&self, now: DateTime<Utc>) -> Vec<MissionId> {
        let retention = chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
        let mut pruned = Vec::new();

        self.missions.retain(|id, entry| {
            let state = entry.snapshot.borrow();
            let expired = state.is_terminal() && now.signed_duration_since(state.updated_at) > retention;
            if expired {
                entry.relay_cancel.cancel();
                pruned.push(id.clone());
            }
            !expired
        });

        if !pruned.is_empty() {
            self.stats.write().missions_pruned += pruned.len() as u64;
            info!(count = pruned.len(), "🧹 Pruned expired missions");
        }
        pruned
    }

    /// Home position a mission will launch from
    pub fn home_of(&self, id: &MissionId) -> EngineResult<GeoPosition> {
        let playbook = self.playbook(id)?;
        Ok(playbook
            .waypoints
            .first()
            .map(|wp| wp.position().with_altitude(0.0))
            .unwrap_or_default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
