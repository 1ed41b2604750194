//! Coverage pattern generation for area missions

use crate::{GeoBounds, GeoPosition, KM_PER_DEGREE, Waypoint, WaypointAction};

/// Lawnmower grid covering a circle's bounding square.
///
/// Rows run east/west, `spacing_m` apart, alternating direction so the
/// vehicle never doubles back across the area. Each row end gets a photo.
pub fn grid_pattern(center: GeoPosition, radius_km: f64, altitude_m: f64, spacing_m: f64) -> Vec<Waypoint> {
    if radius_km <= 0.0 || spacing_m <= 0.0 {
        return Vec::new();
    }

    let bounds = GeoBounds::from_center(&center, radius_km);
    let rows = ((radius_km * 2000.0) / spacing_m).floor() as usize;
    let row_step_deg = spacing_m / (KM_PER_DEGREE * 1000.0);

    let mut waypoints = Vec::with_capacity(rows * 2);
    for row in 0..rows {
        let lat = bounds.min_lat + row as f64 * row_step_deg;
        let (start_lon, end_lon) = if row % 2 == 0 {
            (bounds.min_lon, bounds.max_lon)
        } else {
            (bounds.max_lon, bounds.min_lon)
        };

        waypoints.push(Waypoint::new(lat, start_lon, altitude_m));
        waypoints.push(Waypoint::new(lat, end_lon, altitude_m).with_action(WaypointAction::Photo));
    }

    waypoints
}

/// Evenly spaced points on a circle around `center`, starting due north
pub fn perimeter_pattern(center: GeoPosition, radius_km: f64, altitude_m: f64, points: usize) -> Vec<Waypoint> {
    let lat_radius = radius_km / KM_PER_DEGREE;
    let lon_radius = radius_km / (KM_PER_DEGREE * center.latitude.to_radians().cos());

    (0..points)
        .map(|i| {
            let angle = (i as f64 / points as f64) * std::f64::consts::TAU;
            Waypoint::new(
                center.latitude + lat_radius * angle.cos(),
                center.longitude + lon_radius * angle.sin(),
                altitude_m,
            )
            .with_action(WaypointAction::Photo)
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
