//! GeoJSON import/export for playbook waypoints
//!
//! GeoJSON stores coordinates as `[longitude, latitude, altitude?]` while
//! waypoints use named `lat`/`lon` fields. Conversions here never go through
//! intermediate arithmetic, so a round trip is bit-exact.

use serde_json::{Value, json};

use crate::{
    CoreError, CoreResult, MissionKind, MissionPlaybook, Waypoint, WaypointAction,
};

/// Options applied when building a playbook from map features
#[derive(Debug, Clone)]
pub struct GeoJsonImport {
    pub mission_id: String,
    pub mission_type: MissionKind,
    /// Altitude used for coordinates without a third component
    pub default_altitude_m: f64,
    pub action: Option<WaypointAction>,
}

impl Default for GeoJsonImport {
    fn default() -> Self {
        Self {
            mission_id: String::new(),
            mission_type: MissionKind::Patrol,
            default_altitude_m: 100.0,
            action: Some(WaypointAction::Photo),
        }
    }
}

/// Check that a value is a FeatureCollection with at least one usable geometry
pub fn validate_geojson(geojson: &Value) -> CoreResult<()> {
    if geojson.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(CoreError::invalid_geojson("expected a FeatureCollection"));
    }

    let features = geojson
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::invalid_geojson("missing features array"))?;

    let usable = features.iter().any(|feature| {
        matches!(
            geometry_type(feature),
            Some("Point") | Some("LineString")
        )
    });

    if usable {
        Ok(())
    } else {
        Err(CoreError::invalid_geojson(
            "no Point or LineString features found",
        ))
    }
}

/// Extract waypoints from Point and LineString features, dropping duplicates
pub fn waypoints_from_geojson(geojson: &Value, options: &GeoJsonImport) -> CoreResult<Vec<Waypoint>> {
    validate_geojson(geojson)?;

    let mut waypoints: Vec<Waypoint> = Vec::new();
    let features = geojson["features"].as_array().into_iter().flatten();

    for feature in features {
        let coordinates = &feature["geometry"]["coordinates"];
        let points: Vec<&Value> = match geometry_type(feature) {
            Some("Point") => vec![coordinates],
            Some("LineString") => coordinates.as_array().into_iter().flatten().collect(),
            _ => continue,
        };

        for point in points {
            let waypoint = waypoint_from_coordinate(point, options)?;
            let duplicate = waypoints.iter().any(|existing| {
                existing.lat.to_bits() == waypoint.lat.to_bits()
                    && existing.lon.to_bits() == waypoint.lon.to_bits()
            });
            if !duplicate {
                waypoints.push(waypoint);
            }
        }
    }

    Ok(waypoints)
}

/// Build a playbook from a GeoJSON FeatureCollection
pub fn playbook_from_geojson(geojson: &Value, options: &GeoJsonImport) -> CoreResult<MissionPlaybook> {
    let waypoints = waypoints_from_geojson(geojson, options)?;

    let mut playbook = MissionPlaybook::new(options.mission_id.clone(), options.mission_type);
    playbook.description = format!("Imported from GeoJSON ({} waypoints)", waypoints.len());
    playbook.flight_parameters.altitude_m = options.default_altitude_m;
    playbook.waypoints = waypoints;
    Ok(playbook)
}

/// Render waypoints as a FeatureCollection with the route line and each point
pub fn waypoints_to_geojson(waypoints: &[Waypoint]) -> Value {
    let coordinates: Vec<Value> = waypoints
        .iter()
        .map(|wp| json!([wp.lon, wp.lat, wp.alt]))
        .collect();

    let mut features = vec![json!({
        "type": "Feature",
        "geometry": { "type": "LineString", "coordinates": coordinates },
        "properties": { "name": "route" }
    })];

    features.extend(waypoints.iter().enumerate().map(|(index, wp)| {
        json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [wp.lon, wp.lat, wp.alt] },
            "properties": {
                "index": index,
                "action": wp.action.map(|a| a.to_string()),
            }
        })
    }));

    json!({ "type": "FeatureCollection", "features": features })
}

fn geometry_type(feature: &Value) -> Option<&str> {
    feature.get("geometry")?.get("type")?.as_str()
}

fn waypoint_from_coordinate(point: &Value, options: &GeoJsonImport) -> CoreResult<Waypoint> {
    let values = point
        .as_array()
        .ok_or_else(|| CoreError::invalid_geojson("coordinate is not an array"))?;

    let component = |i: usize| values.get(i).and_then(Value::as_f64);
    let (Some(lon), Some(lat)) = (component(0), component(1)) else {
        return Err(CoreError::invalid_geojson(format!(
            "coordinate needs [lon, lat], got {point}"
        )));
    };

    let mut waypoint = Waypoint::new(lat, lon, component(2).unwrap_or(options.default_altitude_m));
    waypoint.action = options.action;
    Ok(waypoint)
}

// ============================================================================
// TESTS
// ============================================================================
