//! Geographic types and calculations for vehicle positioning

use serde::{Deserialize, Serialize};

/// Earth's radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Approximate kilometers per degree of latitude
pub const KM_PER_DEGREE: f64 = 111.0;

/// Geographic position with latitude, longitude, and altitude
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
    /// Altitude in meters above ground
    pub altitude: f64,
}

impl GeoPosition {
    /// Create a new geographic position
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// Same horizontal position at a different altitude
    pub fn with_altitude(&self, altitude: f64) -> Self {
        Self {
            altitude,
            ..*self
        }
    }

    /// Check if this position is valid
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Calculate distance to another position using Haversine formula
    /// Returns distance in kilometers
    pub fn distance_to(&self, other: &GeoPosition) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_KM * c
    }

    /// Horizontal distance in meters
    pub fn distance_m(&self, other: &GeoPosition) -> f64 {
        self.distance_to(other) * 1000.0
    }

    /// Heading towards another position in degrees [0, 360).
    ///
    /// Uses the planar bearing `atan2(Δlon, Δlat)`, which matches what
    /// observers plot on a flat map for the short legs a mission flies.
    pub fn heading_to(&self, other: &GeoPosition) -> f64 {
        let delta_lat = other.latitude - self.latitude;
        let delta_lon = other.longitude - self.longitude;
        normalize_heading(delta_lon.atan2(delta_lat).to_degrees())
    }

    /// Interpolate between two positions
    /// fraction: 0.0 = self, 1.0 = other
    pub fn interpolate(&self, other: &GeoPosition, fraction: f64) -> GeoPosition {
        let fraction = fraction.clamp(0.0, 1.0);

        GeoPosition::new(
            self.latitude + (other.latitude - self.latitude) * fraction,
            self.longitude + (other.longitude - self.longitude) * fraction,
            self.altitude + (other.altitude - self.altitude) * fraction,
        )
    }

    /// Position `distance_m` away along `heading` degrees, same altitude
    pub fn offset_by(&self, distance_m: f64, heading: f64) -> GeoPosition {
        let meters_per_degree = KM_PER_DEGREE * 1000.0;
        let (sin, cos) = heading.to_radians().sin_cos();
        let lon_scale = self.latitude.to_radians().cos().max(1e-6);

        GeoPosition::new(
            self.latitude + distance_m * cos / meters_per_degree,
            self.longitude + distance_m * sin / (meters_per_degree * lon_scale),
            self.altitude,
        )
    }

    /// Convert to GeoJSON coordinate order `[longitude, latitude, altitude]`
    pub fn to_lon_lat_alt(&self) -> [f64; 3] {
        [self.longitude, self.latitude, self.altitude]
    }
}

/// Normalize any angle in degrees into [0, 360)
pub fn normalize_heading(degrees: f64) -> f64 {
    let heading = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if heading >= 360.0 { 0.0 } else { heading }
}

/// Geographic bounding box for area coverage
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Create bounds from center point and radius in kilometers
    pub fn from_center(center: &GeoPosition, radius_km: f64) -> Self {
        let lat_delta = radius_km / KM_PER_DEGREE;
        let lon_delta = radius_km / (KM_PER_DEGREE * center.latitude.to_radians().cos());

        Self {
            min_lat: center.latitude - lat_delta,
            max_lat: center.latitude + lat_delta,
            min_lon: center.longitude - lon_delta,
            max_lon: center.longitude + lon_delta,
        }
    }

    /// Check if a position is within these bounds
    pub fn contains(&self, position: &GeoPosition) -> bool {
        position.latitude >= self.min_lat
            && position.latitude <= self.max_lat
            && position.longitude >= self.min_lon
            && position.longitude <= self.max_lon
    }
}

// ============================================================================
// TESTS
// ============================================================================
