//! Contingency evaluation.
//!
//! Maps what was observed on a tick (battery, backend signals, elapsed time)
//! onto the playbook's configured responses. Conditions are checked in
//! priority order and the handler remembers one-shot triggers so a sustained
//! condition does not fire again every tick.

use std::sync::Arc;
use std::time::Duration;

use mission_core::{
    ApprovalKind, ContingencyAction, ContingencyPolicy, FaultKind, GeoPosition, MissionStatus,
};
use tracing::debug;

use crate::backend::Signal;

/// Sideways offset used by [`LateralOffsetReroute`]
const DEFAULT_DETOUR_OFFSET_M: f64 = 50.0;

/// Finds a way around an obstacle
pub trait RerouteHook: Send + Sync {
    /// Intermediate position to fly through before resuming, if any
    fn detour(&self, position: &GeoPosition, target: &GeoPosition) -> Option<GeoPosition>;
}

/// Side-steps to the right of the current track, halfway to the target
#[derive(Debug, Clone)]
pub struct LateralOffsetReroute {
    offset_m: f64,
}

impl LateralOffsetReroute {
    pub fn new(offset_m: f64) -> Self {
        Self { offset_m }
    }
}

impl Default for LateralOffsetReroute {
    fn default() -> Self {
        Self::new(DEFAULT_DETOUR_OFFSET_M)
    }
}

impl RerouteHook for LateralOffsetReroute {
    fn detour(&self, position: &GeoPosition, target: &GeoPosition) -> Option<GeoPosition> {
        if position.distance_m(target) < self.offset_m {
            return None;
        }
        let heading = position.heading_to(target);
        let midpoint = position.interpolate(target, 0.5);
        Some(midpoint.offset_by(self.offset_m, heading + 90.0))
    }
}

/// What the runner observed on one tick
#[derive(Debug, Clone)]
pub struct TickContext<'a> {
    pub phase: MissionStatus,
    pub battery: f64,
    pub signals: &'a [Signal],
    pub elapsed: Duration,
    pub position: GeoPosition,
    /// Where the current leg is headed
    pub target: Option<GeoPosition>,
}

/// Response the runner must carry out
#[derive(Debug, Clone, PartialEq)]
pub enum Remedy {
    /// Fly home and land; the mission ends in `ends_as`
    ReturnHome {
        reason: String,
        ends_as: MissionStatus,
    },
    LandNow {
        reason: String,
    },
    /// Hold and ask an operator
    RequestApproval {
        kind: ApprovalKind,
        description: String,
    },
    /// Emit a warning and keep flying
    Warn {
        message: String,
    },
    Abort {
        reason: String,
    },
    /// Unrecoverable: abort and fail the mission
    Fail {
        cause: String,
    },
    /// Fly through `via` before resuming the current leg
    Detour {
        via: GeoPosition,
    },
}

impl Remedy {
    /// Whether this remedy changes what the vehicle does next
    pub fn redirects(&self) -> bool {
        !matches!(self, Remedy::Warn { .. })
    }
}

pub struct ContingencyHandler {
    policy: ContingencyPolicy,
    reserve_pct: f64,
    max_duration: Duration,
    looping: bool,
    reroute: Option<Arc<dyn RerouteHook>>,
    low_battery_fired: bool,
    duration_fired: bool,
}

impl ContingencyHandler {
    pub fn new(policy: &ContingencyPolicy, reserve_pct: f64, max_duration: Duration, looping: bool) -> Self {
        Self {
            policy: policy.resolved(),
            reserve_pct,
            max_duration,
            looping,
            reroute: None,
            low_battery_fired: false,
            duration_fired: false,
        }
    }

    pub fn with_reroute(mut self, hook: Arc<dyn RerouteHook>) -> Self {
        self.reroute = Some(hook);
        self
    }

    pub fn action_for(&self, kind: FaultKind) -> ContingencyAction {
        self.policy.action_for(kind)
    }

    /// Remedies for this tick, most urgent first
    pub fn evaluate(&mut self, ctx: &TickContext<'_>) -> Vec<Remedy> {
        if ctx.battery <= 0.0 && ctx.phase.is_airborne() {
            return vec![Remedy::Fail {
                cause: "Battery depleted in flight".to_string(),
            }];
        }

        if !matches!(ctx.phase, MissionStatus::EnRoute | MissionStatus::Returning) {
            return Vec::new();
        }

        let mut remedies = Vec::new();

        if ctx.battery <= self.reserve_pct && !self.low_battery_fired {
            self.low_battery_fired = true;
            let detail = format!(
                "Battery at {:.1}%, at or below the {:.0}% reserve",
                ctx.battery, self.reserve_pct
            );
            remedies.push(self.respond(FaultKind::LowBattery, detail, ctx));
        }

        for signal in ctx.signals {
            let (kind, detail) = match signal {
                Signal::LinkLost => (FaultKind::CommunicationLoss, "Communication link lost"),
                Signal::GpsLost => (FaultKind::GpsLoss, "GPS fix lost"),
                Signal::Obstacle => (FaultKind::ObstacleDetected, "Obstacle detected on route"),
            };
            remedies.push(self.respond(kind, detail.to_string(), ctx));
        }

        if ctx.phase == MissionStatus::EnRoute && !self.duration_fired && ctx.elapsed > self.max_duration {
            self.duration_fired = true;
            // Loops are meant to run until the time budget is spent
            let ends_as = if self.looping {
                MissionStatus::Completed
            } else {
                MissionStatus::Aborted
            };
            remedies.push(Remedy::ReturnHome {
                reason: format!("Maximum mission duration of {:?} reached", self.max_duration),
                ends_as,
            });
        }

        if !remedies.is_empty() {
            debug!(?remedies, phase = %ctx.phase, "Contingency remedies");
        }
        remedies
    }

    fn respond(&self, kind: FaultKind, detail: String, ctx: &TickContext<'_>) -> Remedy {
        let action = self.policy.action_for(kind);
        match action {
            ContingencyAction::ReturnToHome => {
                if ctx.phase == MissionStatus::Returning {
                    return Remedy::Warn { message: detail };
                }
                Remedy::ReturnHome {
                    reason: detail,
                    ends_as: MissionStatus::Aborted,
                }
            }
            ContingencyAction::LandImmediately => Remedy::LandNow { reason: detail },
            ContingencyAction::HoverAndAlert => Remedy::RequestApproval {
                kind: approval_kind(kind),
                description: detail,
            },
            ContingencyAction::Reroute => {
                let detour = ctx.target.and_then(|target| {
                    self.reroute
                        .as_ref()
                        .and_then(|hook| hook.detour(&ctx.position, &target))
                });
                match detour {
                    Some(via) => Remedy::Detour { via },
                    None => Remedy::RequestApproval {
                        kind: approval_kind(kind),
                        description: format!("{detail}; no detour available"),
                    },
                }
            }
            ContingencyAction::AbortMission => Remedy::Abort { reason: detail },
            ContingencyAction::ContinueMission => Remedy::Warn {
                message: format!("{detail}; continuing mission"),
            },
        }
    }
}

/// Approval category raised for a fault kind
pub fn approval_kind(kind: FaultKind) -> ApprovalKind {
    match kind {
        FaultKind::LowBattery | FaultKind::CommunicationLoss => ApprovalKind::HighRisk,
        FaultKind::GpsLoss => ApprovalKind::Deviation,
        FaultKind::ObstacleDetected => ApprovalKind::Anomaly,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(phase: MissionStatus, battery: f64, signals: &[Signal]) -> TickContext<'_> {
        TickContext {
            phase,
            battery,
            signals,
            elapsed: Duration::from_secs(60),
            position: GeoPosition::new(49.588, 22.676, 100.0),
            target: Some(GeoPosition::new(49.576, 22.651, 100.0)),
        }
    }

    fn handler(policy: ContingencyPolicy) -> ContingencyHandler {
        ContingencyHandler::new(&policy, 20.0, Duration::from_secs(1800), false)
    }

    #[test]
    fn test_low_battery_fires_once() {
        let mut handler = handler(ContingencyPolicy::default());

        assert!(handler.evaluate(&ctx(MissionStatus::EnRoute, 20.5, &[])).is_empty());

        let remedies = handler.evaluate(&ctx(MissionStatus::EnRoute, 19.9, &[]));
        assert!(matches!(
            remedies.as_slice(),
            [Remedy::ReturnHome { ends_as: MissionStatus::Aborted, .. }]
        ));
        assert!(handler.evaluate(&ctx(MissionStatus::EnRoute, 19.0, &[])).is_empty());
    }

    #[test]
    fn test_depleted_battery_fails_in_any_airborne_phase() {
        let mut handler = handler(ContingencyPolicy::default());

        let remedies = handler.evaluate(&ctx(MissionStatus::TakingOff, 0.0, &[]));
        assert!(matches!(remedies.as_slice(), [Remedy::Fail { .. }]));
    }

    #[test]
    fn test_configured_land_immediately() {
        let policy = ContingencyPolicy {
            low_battery: Some(ContingencyAction::LandImmediately),
            ..Default::default()
        };
        let mut handler = handler(policy);

        let remedies = handler.evaluate(&ctx(MissionStatus::EnRoute, 15.0, &[]));
        assert!(matches!(remedies.as_slice(), [Remedy::LandNow { .. }]));
    }

    #[test]
    fn test_signal_defaults() {
        let mut handler = handler(ContingencyPolicy::default());

        let remedies = handler.evaluate(&ctx(
            MissionStatus::EnRoute,
            80.0,
            &[Signal::LinkLost, Signal::GpsLost],
        ));
        assert_eq!(remedies.len(), 2);
        assert!(matches!(
            &remedies[0],
            Remedy::RequestApproval { kind: ApprovalKind::HighRisk, .. }
        ));
        assert!(matches!(
            &remedies[1],
            Remedy::RequestApproval { kind: ApprovalKind::Deviation, .. }
        ));
    }

    #[test]
    fn test_continue_mission_only_warns() {
        let policy = ContingencyPolicy {
            gps_loss: Some(ContingencyAction::ContinueMission),
            ..Default::default()
        };
        let mut handler = handler(policy);

        let remedies = handler.evaluate(&ctx(MissionStatus::EnRoute, 80.0, &[Signal::GpsLost]));
        assert_eq!(remedies.len(), 1);
        assert!(!remedies[0].redirects());
    }

    #[test]
    fn test_reroute_uses_hook_or_falls_back() {
        let mut without_hook = handler(ContingencyPolicy::default());
        let remedies = without_hook.evaluate(&ctx(MissionStatus::EnRoute, 80.0, &[Signal::Obstacle]));
        assert!(matches!(
            remedies.as_slice(),
            [Remedy::RequestApproval { kind: ApprovalKind::Anomaly, .. }]
        ));

        let mut with_hook =
            handler(ContingencyPolicy::default()).with_reroute(Arc::new(LateralOffsetReroute::default()));
        let remedies = with_hook.evaluate(&ctx(MissionStatus::EnRoute, 80.0, &[Signal::Obstacle]));
        let [Remedy::Detour { via }] = remedies.as_slice() else {
            panic!("expected a detour, got {remedies:?}");
        };
        assert_eq!(via.altitude, 100.0);
    }

    #[test]
    fn test_no_redirects_outside_flight_phases() {
        let mut handler = handler(ContingencyPolicy::default());
        assert!(handler
            .evaluate(&ctx(MissionStatus::Landing, 10.0, &[Signal::Obstacle]))
            .is_empty());
        assert!(handler
            .evaluate(&ctx(MissionStatus::AwaitingApproval, 10.0, &[]))
            .is_empty());
    }

    #[test]
    fn test_low_battery_while_returning_only_warns() {
        let mut handler = handler(ContingencyPolicy::default());
        let remedies = handler.evaluate(&ctx(MissionStatus::Returning, 10.0, &[]));
        assert!(matches!(remedies.as_slice(), [Remedy::Warn { .. }]));
    }

    #[test]
    fn test_duration_limit_on_loop_completes() {
        let mut handler =
            ContingencyHandler::new(&ContingencyPolicy::default(), 20.0, Duration::from_secs(30), true);

        let remedies = handler.evaluate(&ctx(MissionStatus::EnRoute, 80.0, &[]));
        assert!(matches!(
            remedies.as_slice(),
            [Remedy::ReturnHome { ends_as: MissionStatus::Completed, .. }]
        ));
        assert!(handler.evaluate(&ctx(MissionStatus::EnRoute, 80.0, &[])).is_empty());
    }
}
