//! API server configuration
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! `mission-control.toml` in the working directory, and `MISSION_*`
//! environment variables (a `.env` file is loaded first when present).

use std::time::Duration;

use config::{Config, Environment, File};
use mission_core::SafetyBounds;
use mission_engine::{ApprovalConfig, ApprovalTimeoutPolicy, ApprovalTrigger, EngineConfig, SimulationConfig};
use serde::Deserialize;

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    /// REST API port
    pub api_port: u16,
    /// WebSocket port
    pub ws_port: u16,
    /// Enable CORS for all origins (development)
    pub cors_permissive: bool,
    /// Base URL missions relay their telemetry to, e.g. `ws://relay:9000/missions`
    pub relay_url: Option<String>,

    /// Navigation and telemetry tick
    pub tick_interval_ms: u64,
    pub approval_probability: f64,
    pub approval_trigger: ApprovalTrigger,
    pub approval_timeout_secs: u64,
    pub approval_on_timeout: ApprovalTimeoutPolicy,
    pub battery_reserve_pct: f64,
    pub action_failures_fatal: bool,
    pub simulation_seed: Option<u64>,
    pub safety: SafetyBounds,

    /// How long finished missions stay queryable
    pub retention_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            host: "0.0.0.0".into(),
            api_port: 3000,
            ws_port: 9090,
            cors_permissive: true,
            relay_url: None,
            tick_interval_ms: engine.tick_interval.as_millis() as u64,
            approval_probability: engine.simulation.approval_probability,
            approval_trigger: engine.approval.trigger,
            approval_timeout_secs: engine.approval.timeout.as_secs(),
            approval_on_timeout: engine.approval.on_timeout,
            battery_reserve_pct: engine.battery_reserve_pct,
            action_failures_fatal: engine.action_failures_fatal,
            simulation_seed: None,
            safety: engine.safety,
            retention_secs: engine.retention.as_secs(),
            prune_interval_secs: 60,
        }
    }
}

impl ApiConfig {
    /// Load configuration from `mission-control.toml` and the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        Config::builder()
            .add_source(File::with_name("mission-control").required(false))
            .add_source(
                Environment::with_prefix("MISSION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Engine settings derived from this configuration
    pub fn engine(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            safety: self.safety.clone(),
            simulation: SimulationConfig {
                approval_probability: self.approval_probability.clamp(0.0, 1.0),
                seed: self.simulation_seed,
                ..defaults.simulation
            },
            approval: ApprovalConfig {
                trigger: self.approval_trigger,
                timeout: Duration::from_secs(self.approval_timeout_secs),
                on_timeout: self.approval_on_timeout,
            },
            battery_reserve_pct: self.battery_reserve_pct,
            action_failures_fatal: self.action_failures_fatal,
            retention: Duration::from_secs(self.retention_secs),
            ..defaults
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine() {
        let config = ApiConfig::default();
        let engine = config.engine();

        assert_eq!(config.api_port, 3000);
        assert_eq!(config.ws_port, 9090);
        assert!(config.relay_url.is_none());
        assert_eq!(engine.tick_interval, Duration::from_secs(1));
        assert_eq!(engine.approval.timeout, Duration::from_secs(300));
        assert_eq!(engine.approval.on_timeout, ApprovalTimeoutPolicy::Deny);
        assert_eq!(engine.retention, Duration::from_secs(600));
        assert_eq!(engine.battery_reserve_pct, 20.0);
    }

    #[test]
    fn test_overrides_flow_into_engine() {
        let config = ApiConfig {
            tick_interval_ms: 250,
            approval_probability: 3.0,
            approval_on_timeout: ApprovalTimeoutPolicy::Approve,
            simulation_seed: Some(9),
            ..ApiConfig::default()
        };
        let engine = config.engine();

        assert_eq!(engine.tick_interval, Duration::from_millis(250));
        assert_eq!(engine.simulation.approval_probability, 1.0);
        assert_eq!(engine.simulation.seed, Some(9));
        assert_eq!(engine.approval.on_timeout, ApprovalTimeoutPolicy::Approve);
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: ApiConfig = Config::builder()
            .add_source(File::from_str(
                "api_port = 8080\nrelay_url = \"ws://relay/missions\"\n[safety]\nmax_altitude_m = 120.0\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.ws_port, 9090);
        assert_eq!(config.relay_url.as_deref(), Some("ws://relay/missions"));
        assert_eq!(config.safety.max_altitude_m, 120.0);
        assert_eq!(config.safety.min_altitude_m, 10.0);
    }
}
