//! Engine configuration

use std::time::Duration;

use mission_core::SafetyBounds;
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::navigator::RoutePolicy;

/// Mission execution configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the telemetry/navigation tick
    pub tick_interval: Duration,
    pub safety: SafetyBounds,
    pub simulation: SimulationConfig,
    pub timeouts: BackendTimeouts,
    pub approval: ApprovalConfig,
    /// Battery percentage that forces the low-battery contingency
    pub battery_reserve_pct: f64,
    /// Escalate failed photo/hover/scan actions into a mission failure
    pub action_failures_fatal: bool,
    /// Force loop or terminate regardless of mission type
    pub route_policy_override: Option<RoutePolicy>,
    pub connect_retry: RetryPolicy,
    pub relay_retry: RetryPolicy,
    /// How long terminal missions stay queryable
    pub retention: Duration,
    pub channel_capacity: usize,
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            safety: SafetyBounds::default(),
            simulation: SimulationConfig::default(),
            timeouts: BackendTimeouts::default(),
            approval: ApprovalConfig::default(),
            battery_reserve_pct: 20.0,
            action_failures_fatal: false,
            route_policy_override: None,
            connect_retry: RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(500),
                max: Duration::from_secs(2),
            },
            relay_retry: RetryPolicy::default(),
            retention: Duration::from_secs(600),
            channel_capacity: 1024,
            history_limit: 1000,
        }
    }
}

/// Parameters of the software stand-in vehicle
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Fraction of a leg covered per tick
    pub progress_per_tick: f64,
    /// Battery percentage drained per tick while moving
    pub drain_per_tick: f64,
    /// Battery percentage drained per tick while climbing, descending or hovering
    pub idle_drain_per_tick: f64,
    pub takeoff_ticks: u32,
    pub landing_ticks: u32,
    /// Simulated seconds represented by one tick
    pub seconds_per_tick: f64,
    /// Chance per check that an anomaly needs operator approval
    pub approval_probability: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            progress_per_tick: 0.02,
            drain_per_tick: 0.15,
            idle_drain_per_tick: 0.05,
            takeoff_ticks: 5,
            landing_ticks: 8,
            seconds_per_tick: 1.0,
            approval_probability: 0.0,
            seed: None,
        }
    }
}

/// Upper bounds for every blocking backend call
#[derive(Debug, Clone)]
pub struct BackendTimeouts {
    pub connect: Duration,
    pub takeoff: Duration,
    pub land: Duration,
    /// Base bound for in-place actions; hover time is added on top
    pub action: Duration,
    pub abort: Duration,
    /// Slack added to the travel-time estimate of each leg
    pub leg_margin: Duration,
}

impl BackendTimeouts {
    /// Bound for flying a leg: twice the nominal travel time plus margin
    pub fn leg(&self, length_m: f64, speed_mps: f64) -> Duration {
        let nominal = if speed_mps > 0.0 {
            length_m.max(0.0) / speed_mps
        } else {
            0.0
        };
        Duration::try_from_secs_f64(nominal * 2.0)
            .unwrap_or(Duration::MAX)
            .saturating_add(self.leg_margin)
    }

    pub fn action_with_hover(&self, hover: Duration) -> Duration {
        self.action.saturating_add(hover)
    }
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            takeoff: Duration::from_secs(10),
            land: Duration::from_secs(30),
            action: Duration::from_secs(10),
            abort: Duration::from_secs(15),
            leg_margin: Duration::from_secs(30),
        }
    }
}

/// When the approval trigger is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTrigger {
    #[default]
    PerTick,
    PerWaypoint,
}

/// Decision applied when an approval is not answered in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutPolicy {
    #[default]
    Deny,
    Approve,
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub trigger: ApprovalTrigger,
    /// Maximum wait for an operator decision
    pub timeout: Duration,
    pub on_timeout: ApprovalTimeoutPolicy,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            trigger: ApprovalTrigger::PerTick,
            timeout: Duration::from_secs(300),
            on_timeout: ApprovalTimeoutPolicy::Deny,
        }
    }
}

/// Bounded retry schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base, self.max, self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leg_timeout() {
        let timeouts = BackendTimeouts::default();
        assert_eq!(timeouts.leg(1000.0, 10.0), Duration::from_secs(230));
        assert_eq!(timeouts.leg(1000.0, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.battery_reserve_pct, 20.0);
        assert_eq!(config.approval.on_timeout, ApprovalTimeoutPolicy::Deny);
        assert_eq!(config.relay_retry.max_attempts, 5);
        assert_eq!(config.simulation.progress_per_tick, 0.02);
    }
}
