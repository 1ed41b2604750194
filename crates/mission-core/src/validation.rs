//! Pre-flight validation of mission playbooks against safety bounds
//!
//! Validation is pure: the same playbook and bounds always produce the same
//! report. A playbook must pass before the engine will start it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CoreError, CoreResult, FaultKind, MissionPlaybook};

/// Safety envelope every playbook is checked against
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyBounds {
    pub min_altitude_m: f64,
    pub max_altitude_m: f64,
    pub max_speed_mps: f64,
    /// Upper bound for a playbook's own `max_duration_min`
    pub max_duration_cap_min: f64,
    pub climb_rate_mps: f64,
    pub descent_rate_mps: f64,
}

impl Default for SafetyBounds {
    fn default() -> Self {
        Self {
            min_altitude_m: 10.0,
            max_altitude_m: 150.0,
            max_speed_mps: 15.0,
            max_duration_cap_min: 60.0,
            climb_rate_mps: 2.0,
            descent_rate_mps: 1.0,
        }
    }
}

/// A single violated constraint
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    #[error("playbook has no waypoints")]
    NoWaypoints,

    #[error("waypoint {index} has invalid coordinates ({lat}, {lon})")]
    WaypointCoordinates { index: usize, lat: f64, lon: f64 },

    #[error("waypoint {index} altitude {alt}m outside [{min}, {max}]m")]
    WaypointAltitude {
        index: usize,
        alt: f64,
        min: f64,
        max: f64,
    },

    #[error("flight altitude {alt}m outside [{min}, {max}]m")]
    FlightAltitude { alt: f64, min: f64, max: f64 },

    #[error("speed {speed}m/s must be positive and at most {max}m/s")]
    Speed { speed: f64, max: f64 },

    #[error("max duration {max_min}min exceeds the {cap_min}min limit")]
    DurationCap { max_min: f64, cap_min: f64 },

    #[error("estimated duration {estimated_min:.1}min exceeds max duration {max_min}min")]
    DurationExceeded { estimated_min: f64, max_min: f64 },
}

/// Outcome of validating one playbook
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub mission_id: String,
    pub violations: Vec<Violation>,
    /// Contingency kinds that will run with their default action
    pub defaulted: Vec<FaultKind>,
    pub estimated_duration_min: f64,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }

    /// Convert a failed report into a `CoreError::Validation`
    pub fn into_result(self) -> CoreResult<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(CoreError::Validation {
                mission_id: self.mission_id.clone(),
                violations: self.messages(),
            })
        }
    }
}

/// Checks playbooks against a fixed set of safety bounds
#[derive(Debug, Clone, Default)]
pub struct PlaybookValidator {
    bounds: SafetyBounds,
}

impl PlaybookValidator {
    pub fn new(bounds: SafetyBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    pub fn validate(&self, playbook: &MissionPlaybook) -> ValidationReport {
        validate(playbook, &self.bounds)
    }

    /// Validate and fail with every violation description
    pub fn check(&self, playbook: &MissionPlaybook) -> CoreResult<ValidationReport> {
        self.validate(playbook).into_result()
    }
}

/// Validate a playbook against the given bounds
pub fn validate(playbook: &MissionPlaybook, bounds: &SafetyBounds) -> ValidationReport {
    let mut violations = Vec::new();
    let altitude_range = bounds.min_altitude_m..=bounds.max_altitude_m;

    if playbook.waypoints.is_empty() {
        violations.push(Violation::NoWaypoints);
    }

    for (index, wp) in playbook.waypoints.iter().enumerate() {
        if !wp.position().is_valid() {
            violations.push(Violation::WaypointCoordinates {
                index,
                lat: wp.lat,
                lon: wp.lon,
            });
        }
        if !altitude_range.contains(&wp.alt) {
            violations.push(Violation::WaypointAltitude {
                index,
                alt: wp.alt,
                min: bounds.min_altitude_m,
                max: bounds.max_altitude_m,
            });
        }
    }

    let params = &playbook.flight_parameters;
    if !altitude_range.contains(&params.altitude_m) {
        violations.push(Violation::FlightAltitude {
            alt: params.altitude_m,
            min: bounds.min_altitude_m,
            max: bounds.max_altitude_m,
        });
    }

    let speed_ok = params.speed_mps > 0.0 && params.speed_mps <= bounds.max_speed_mps;
    if !speed_ok {
        violations.push(Violation::Speed {
            speed: params.speed_mps,
            max: bounds.max_speed_mps,
        });
    }

    let max_min = playbook.max_duration_min;
    if max_min.is_nan() || max_min > bounds.max_duration_cap_min {
        violations.push(Violation::DurationCap {
            max_min: playbook.max_duration_min,
            cap_min: bounds.max_duration_cap_min,
        });
    }

    let estimated_duration_min = if speed_ok {
        estimate_duration_min(playbook, bounds)
    } else {
        f64::INFINITY
    };
    if speed_ok && estimated_duration_min > playbook.max_duration_min {
        violations.push(Violation::DurationExceeded {
            estimated_min: estimated_duration_min,
            max_min: playbook.max_duration_min,
        });
    }

    ValidationReport {
        mission_id: playbook.mission_id.clone(),
        violations,
        defaulted: playbook.contingencies.defaulted_kinds(),
        estimated_duration_min,
    }
}

/// Estimated flight time in minutes for one pass of the route.
///
/// Counts the climb to the first waypoint, horizontal travel (including the
/// loop closure leg for looping missions), hover time at waypoints and the
/// final descent.
pub fn estimate_duration_min(playbook: &MissionPlaybook, bounds: &SafetyBounds) -> f64 {
    let (Some(first), Some(last)) = (playbook.waypoints.first(), playbook.waypoints.last()) else {
        return 0.0;
    };

    let looping = playbook.mission_type.loops_by_default();
    let travel_m = playbook.route_length_km(looping) * 1000.0;
    let travel_secs = travel_m / playbook.flight_parameters.speed_mps;

    let hover_secs: f64 = playbook
        .waypoints
        .iter()
        .map(|wp| wp.hover_duration().as_secs_f64())
        .sum();

    let landing_alt = if looping { first.alt } else { last.alt };
    let climb_secs = first.alt.max(0.0) / bounds.climb_rate_mps;
    let descent_secs = landing_alt.max(0.0) / bounds.descent_rate_mps;

    (climb_secs + travel_secs + hover_secs + descent_secs) / 60.0
}

// ============================================================================
// TESTS
// ============================================================================
