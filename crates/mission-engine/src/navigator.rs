//! Waypoint navigation: legs, interpolation and route advance.
//!
//! The navigator is pure. It never touches a backend or a clock; both
//! backends and the state machine use it to agree on where the vehicle is
//! headed and what comes after each arrival.

use std::sync::Arc;

use mission_core::{GeoPosition, MissionKind, Waypoint};
use serde::{Deserialize, Serialize};

/// What happens after the last waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Land at the last waypoint
    Terminate,
    /// Fly back to the first waypoint and go around again
    Loop,
}

impl RoutePolicy {
    pub fn for_kind(kind: MissionKind) -> Self {
        if kind.loops_by_default() {
            RoutePolicy::Loop
        } else {
            RoutePolicy::Terminate
        }
    }
}

/// Purpose of a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegKind {
    /// Launch point to the first waypoint
    Departure,
    /// Waypoint `to - 1` to waypoint `to`
    Transit { to: usize },
    /// Last waypoint back to the first on a looping route
    LoopClosure,
    /// Current position back to the launch point
    ReturnHome,
    /// Side step around an obstacle, rejoining towards `resume_to`
    Detour { resume_to: usize },
}

/// A straight segment between two positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub kind: LegKind,
    pub from: GeoPosition,
    pub to: GeoPosition,
}

impl Leg {
    pub fn new(kind: LegKind, from: GeoPosition, to: GeoPosition) -> Self {
        Self { kind, from, to }
    }

    /// Straight-line length including the altitude change, in meters
    pub fn length_m(&self) -> f64 {
        let horizontal = self.from.distance_m(&self.to);
        let vertical = self.to.altitude - self.from.altitude;
        (horizontal * horizontal + vertical * vertical).sqrt()
    }

    /// Legs shorter than a centimeter complete without moving
    pub fn is_degenerate(&self) -> bool {
        self.length_m() < 0.01
    }

    /// Same destination, starting from a new position
    pub fn restart_from(&self, position: GeoPosition) -> Self {
        Self {
            from: position,
            ..*self
        }
    }

    /// Waypoint index reached when this leg completes
    pub fn arrival_index(&self) -> Option<usize> {
        match self.kind {
            LegKind::Departure | LegKind::LoopClosure => Some(0),
            LegKind::Transit { to } => Some(to),
            LegKind::ReturnHome | LegKind::Detour { .. } => None,
        }
    }
}

/// Interpolated position and heading along a leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavFix {
    pub position: GeoPosition,
    pub heading: f64,
}

/// What to fly after arriving at the end of a leg
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Next(Leg),
    Complete,
}

#[derive(Debug, Clone)]
pub struct WaypointNavigator {
    waypoints: Arc<[Waypoint]>,
    policy: RoutePolicy,
}

impl WaypointNavigator {
    pub fn new(waypoints: impl Into<Arc<[Waypoint]>>, policy: RoutePolicy) -> Self {
        Self {
            waypoints: waypoints.into(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    pub fn waypoint(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    /// Waypoint index following `from_index`; `None` means the route ends there.
    ///
    /// `from_index == len()` denotes the loop closure leg on looping routes.
    pub fn next_index(&self, from_index: usize) -> Option<usize> {
        let n = self.waypoints.len();
        if n == 0 {
            return None;
        }
        if from_index + 1 < n {
            return Some(from_index + 1);
        }
        match self.policy {
            RoutePolicy::Loop if n > 1 && from_index <= n => Some(0),
            _ => None,
        }
    }

    /// Interpolate between waypoint `from_index` and the one after it.
    ///
    /// On a terminating route the last waypoint interpolates to itself; on a
    /// looping route `from_index == len()` (and the last index) interpolate
    /// along the closure leg towards waypoint 0.
    pub fn interpolate(&self, from_index: usize, progress: f64) -> Option<NavFix> {
        let n = self.waypoints.len();
        if n == 0 || from_index > n {
            return None;
        }

        let from = self.waypoints[from_index.min(n - 1)].position();
        let to = match self.next_index(from_index) {
            Some(next) => self.waypoints[next].position(),
            None => from,
        };
        Some(Self::fix_between(&from, &to, progress))
    }

    /// Interpolated fix along a leg
    pub fn fix(leg: &Leg, progress: f64) -> NavFix {
        Self::fix_between(&leg.from, &leg.to, progress)
    }

    fn fix_between(from: &GeoPosition, to: &GeoPosition, progress: f64) -> NavFix {
        NavFix {
            position: from.interpolate(to, progress),
            heading: from.heading_to(to),
        }
    }

    /// Altitude the vehicle climbs to before the first leg
    pub fn takeoff_altitude(&self) -> f64 {
        self.waypoints.first().map(|wp| wp.alt).unwrap_or_default()
    }

    /// Leg from the airborne vehicle to the first waypoint
    pub fn first_leg(&self, from: GeoPosition) -> Option<Leg> {
        let first = self.waypoints.first()?;
        Some(Leg::new(LegKind::Departure, from, first.position()))
    }

    /// Leg back to the launch point, holding the current altitude
    pub fn return_leg(&self, position: GeoPosition, home: GeoPosition) -> Leg {
        Leg::new(
            LegKind::ReturnHome,
            position,
            home.with_altitude(position.altitude),
        )
    }

    /// Next leg after completing `leg`
    pub fn after_arrival(&self, leg: &Leg) -> Advance {
        let n = self.waypoints.len();
        let arrived = match leg.kind {
            LegKind::Departure | LegKind::LoopClosure => 0,
            LegKind::Transit { to } => to,
            LegKind::Detour { resume_to } => {
                return match self.waypoints.get(resume_to) {
                    Some(wp) => Advance::Next(Leg::new(
                        LegKind::Transit { to: resume_to },
                        leg.to,
                        wp.position(),
                    )),
                    None => Advance::Complete,
                };
            }
            LegKind::ReturnHome => return Advance::Complete,
        };

        match self.next_index(arrived) {
            Some(0) if arrived == n - 1 => Advance::Next(Leg::new(
                LegKind::LoopClosure,
                self.waypoints[arrived].position(),
                self.waypoints[0].position(),
            )),
            Some(next) => Advance::Next(Leg::new(
                LegKind::Transit { to: next },
                self.waypoints[arrived].position(),
                self.waypoints[next].position(),
            )),
            None => Advance::Complete,
        }
    }

    /// Waypoint index reported to observers while flying `leg`.
    ///
    /// This is the index being approached; the loop closure leg reports
    /// `len()` so observers can tell it apart from the first transit.
    pub fn reported_index(&self, leg: &Leg, current: usize) -> usize {
        match leg.kind {
            LegKind::Departure => 0,
            LegKind::Transit { to } | LegKind::Detour { resume_to: to } => to,
            LegKind::LoopClosure => self.waypoints.len(),
            LegKind::ReturnHome => current,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
