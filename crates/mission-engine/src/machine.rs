//! Mission phase bookkeeping.
//!
//! [`MissionStateMachine`] is the single writer of a mission's
//! [`DroneState`]. Every change is published to a `watch` snapshot and
//! mirrored as telemetry events. Once a terminal phase is reached the state
//! is frozen and nothing more is emitted.

use mission_core::{
    Approval, CoreError, CoreResult, DroneState, GeoPosition, HumanDecision, MissionStatus,
    TelemetryEvent, WarningLevel,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::Progress;
use crate::channel::TelemetryChannel;

pub struct MissionStateMachine {
    state: DroneState,
    snapshot: watch::Sender<DroneState>,
    channel: TelemetryChannel,
    closed: bool,
}

impl MissionStateMachine {
    pub fn new(state: DroneState, snapshot: watch::Sender<DroneState>, channel: TelemetryChannel) -> Self {
        snapshot.send_replace(state.clone());
        Self {
            state,
            snapshot,
            channel,
            closed: false,
        }
    }

    pub fn state(&self) -> &DroneState {
        &self.state
    }

    pub fn phase(&self) -> MissionStatus {
        self.state.phase
    }

    pub fn position(&self) -> GeoPosition {
        self.state.position
    }

    pub fn channel(&self) -> &TelemetryChannel {
        &self.channel
    }

    /// Whether the terminal event has been emitted
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn publish(&mut self) {
        self.state.updated_at = chrono::Utc::now();
        self.snapshot.send_replace(self.state.clone());
    }

    fn emit(&self, event: TelemetryEvent) {
        if !self.closed {
            self.channel.publish(event);
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(&mut self, next: MissionStatus) -> CoreResult<()> {
        let current = self.state.phase;
        if self.closed || !current.can_transition_to(next) {
            return Err(CoreError::invalid_transition(current, next));
        }

        self.state.set_phase(next);
        info!(
            mission_id = %self.state.mission_id,
            from = %current,
            to = %next,
            "Mission phase changed"
        );
        self.emit(TelemetryEvent::status_change(current, next));
        self.publish();
        Ok(())
    }

    /// Apply a backend progress sample and emit one position update
    pub fn apply_progress(&mut self, progress: &Progress) {
        if self.closed {
            return;
        }

        self.state.position = progress.position;
        self.state.heading = progress.heading;
        self.state.speed = progress.speed;
        // Battery never rises mid-mission
        self.state.battery = self.state.battery.min(progress.battery.max(0.0));
        self.publish();
        self.emit(TelemetryEvent::position_update(&self.state));
    }

    /// Battery and position reported when the session is established
    pub fn sync_vehicle(&mut self, position: Option<GeoPosition>, battery: Option<f64>) {
        if let Some(position) = position {
            self.state.position = position;
        }
        if let Some(battery) = battery {
            self.state.battery = battery.clamp(0.0, 100.0);
        }
        self.publish();
    }

    pub fn set_target_index(&mut self, index: usize) {
        if self.state.current_waypoint_index != index {
            self.state.current_waypoint_index = index;
            self.publish();
        }
    }

    pub fn waypoint_reached(&mut self, index: usize) {
        self.state.current_waypoint_index = index;
        self.publish();
        self.emit(TelemetryEvent::waypoint_reached(index, self.state.total_waypoints));
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.state.paused = paused;
        self.publish();
    }

    pub fn warn(&self, level: WarningLevel, message: impl Into<String>) {
        let message = message.into();
        warn!(mission_id = %self.state.mission_id, ?level, "{message}");
        self.emit(TelemetryEvent::warning(level, message));
    }

    pub fn approval_required(&self, approval: &Approval) {
        self.emit(TelemetryEvent::ApprovalRequired {
            approval: approval.clone(),
        });
    }

    pub fn approval_resolved(&self, decision: &HumanDecision) {
        self.emit(TelemetryEvent::approval_resolved(decision));
    }

    /// Landing → Completed, closing the stream with `mission_complete`
    pub fn complete(&mut self) -> CoreResult<()> {
        self.transition(MissionStatus::Completed)?;
        self.emit(TelemetryEvent::MissionComplete {});
        self.closed = true;
        info!(mission_id = %self.state.mission_id, "✅ Mission completed");
        Ok(())
    }

    /// Stop in `Aborted` or `Failed`, closing the stream with an error event.
    ///
    /// No-op on a mission that is already terminal.
    pub fn finish(&mut self, status: MissionStatus, message: impl Into<String>) {
        if self.closed || self.state.is_terminal() {
            return;
        }
        let status = match status {
            MissionStatus::Aborted | MissionStatus::Failed => status,
            _ => MissionStatus::Failed,
        };
        let message = message.into();
        let current = self.state.phase;

        self.state.set_phase(status);
        self.emit(TelemetryEvent::status_change(current, status));
        self.emit(TelemetryEvent::error(message.clone(), status));
        self.closed = true;
        self.publish();

        warn!(
            mission_id = %self.state.mission_id,
            from = %current,
            %status,
            cause = %message,
            "Mission stopped"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mission_core::{MissionId, TelemetryEnvelope};
    use tokio::sync::broadcast;

    fn machine() -> (MissionStateMachine, watch::Receiver<DroneState>, broadcast::Receiver<TelemetryEnvelope>) {
        let id = MissionId::new("m-1");
        let channel = TelemetryChannel::new(id.clone(), 64, 100);
        let events = channel.subscribe();
        let state = DroneState::new(id, GeoPosition::new(49.588, 22.676, 0.0), 3);
        let (tx, rx) = watch::channel(state.clone());
        (MissionStateMachine::new(state, tx, channel), rx, events)
    }

    fn progress(battery: f64) -> Progress {
        Progress {
            position: GeoPosition::new(49.58, 22.66, 100.0),
            heading: 225.0,
            speed: 10.0,
            battery,
            fraction: 0.5,
            signals: Vec::new(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<TelemetryEnvelope>) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[test]
    fn test_transition_emits_status_change_and_snapshot() {
        let (mut machine, snapshot, mut events) = machine();

        machine.transition(MissionStatus::TakingOff).unwrap();

        assert_eq!(snapshot.borrow().phase, MissionStatus::TakingOff);
        assert_eq!(
            drain(&mut events),
            vec![TelemetryEvent::status_change(MissionStatus::Planned, MissionStatus::TakingOff)]
        );
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let (mut machine, _snapshot, _events) = machine();

        let err = machine.transition(MissionStatus::Landing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(machine.phase(), MissionStatus::Planned);
    }

    #[test]
    fn test_battery_never_increases() {
        let (mut machine, _snapshot, _events) = machine();

        machine.apply_progress(&progress(80.0));
        machine.apply_progress(&progress(85.0));
        assert_eq!(machine.state().battery, 80.0);
    }

    #[test]
    fn test_complete_closes_stream() {
        let (mut machine, _snapshot, mut events) = machine();
        for phase in [MissionStatus::TakingOff, MissionStatus::EnRoute, MissionStatus::Landing] {
            machine.transition(phase).unwrap();
        }
        drain(&mut events);

        machine.complete().unwrap();
        machine.apply_progress(&progress(50.0));
        machine.finish(MissionStatus::Aborted, "too late");

        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                TelemetryEvent::status_change(MissionStatus::Landing, MissionStatus::Completed),
                TelemetryEvent::MissionComplete {},
            ]
        );
        assert_eq!(machine.phase(), MissionStatus::Completed);
        assert!(machine.transition(MissionStatus::Aborted).is_err());
    }

    #[test]
    fn test_finish_freezes_state() {
        let (mut machine, snapshot, mut events) = machine();
        machine.transition(MissionStatus::TakingOff).unwrap();
        drain(&mut events);

        machine.finish(MissionStatus::Failed, "takeoff fault: motor");
        let frozen = snapshot.borrow().clone();
        machine.apply_progress(&progress(10.0));

        assert_eq!(frozen.phase, MissionStatus::Failed);
        assert_eq!(snapshot.borrow().position, frozen.position);
        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            TelemetryEvent::error("takeoff fault: motor", MissionStatus::Failed)
        );
    }
}
