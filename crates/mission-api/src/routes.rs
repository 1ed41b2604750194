//! API route definitions

use crate::handlers;
use crate::state::AppState;

use axum::{
    Router,
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use std::time::{Duration, Instant};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.cors_permissive {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new().allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        // Health & Status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::system_status))

        // Metrics (Prometheus format)
        .route("/metrics", get(handlers::metrics))

        // Missions API
        .route(
            "/api/v1/missions",
            get(handlers::list_missions).post(handlers::create_mission),
        )
        .route("/api/v1/missions/validate", post(handlers::validate_playbook))
        .route("/api/v1/missions/{id}", get(handlers::get_mission))
        .route("/api/v1/missions/{id}/start", post(handlers::start_mission))
        .route("/api/v1/missions/{id}/pause", post(handlers::pause_mission))
        .route("/api/v1/missions/{id}/resume", post(handlers::resume_mission))
        .route("/api/v1/missions/{id}/abort", post(handlers::abort_mission))

        // Approvals API
        .route("/api/v1/approvals/decision", post(handlers::submit_decision))

        // Playbook import
        .route("/api/v1/playbooks/geojson", post(handlers::playbook_from_features))

        // WebSocket info
        .route("/api/v1/ws/info", get(handlers::websocket_info))

        // Apply middleware
        .route_layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Count every request and its latency, labelled by route template
async fn record_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    state.metrics.record_api_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let config = ApiConfig {
            tick_interval_ms: 1,
            ..ApiConfig::default()
        };
        let state = AppState::new(config).unwrap();
        (create_router(state.clone()), state)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn delivery(id: &str) -> Value {
        json!({
            "mission_id": id,
            "mission_type": "delivery",
            "waypoints": [
                {"lat": 49.588, "lon": 22.676, "alt": 100.0},
                {"lat": 49.590, "lon": 22.678, "alt": 100.0, "action": "photo"}
            ]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_create_get_and_list() {
        let (app, _) = app();

        let (status, body) = call(&app, Method::POST, "/api/v1/missions", Some(delivery("api-1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["mission_id"], "api-1");
        assert_eq!(body["state"]["phase"], "planned");
        assert!(body["stream_url"].as_str().unwrap().ends_with("/ws/mission/api-1"));

        let (status, body) = call(&app, Method::GET, "/api/v1/missions/api-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["playbook"]["waypoints"].as_array().unwrap().len(), 2);
        assert_eq!(body["route"]["type"], "FeatureCollection");

        let (status, body) = call(&app, Method::GET, "/api/v1/missions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (status, _) = call(&app, Method::POST, "/api/v1/missions", Some(delivery("api-1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_playbook_lists_violations() {
        let (app, _) = app();
        let playbook = json!({
            "mission_id": "too-high",
            "mission_type": "delivery",
            "waypoints": [{"lat": 49.588, "lon": 22.676, "alt": 400.0}]
        });

        let (status, body) = call(&app, Method::POST, "/api/v1/missions/validate", Some(playbook.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["violations"].as_array().unwrap().is_empty());

        let (status, body) = call(&app, Method::POST, "/api/v1/missions", Some(playbook)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_playbook");
        assert!(!body["details"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _) = app();
        let (status, body) = call(&app, Method::POST, "/api/v1/missions", Some(json!({"waypoints": 3}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_unknown_mission_and_decision() {
        let (app, _) = app();

        let (status, _) = call(&app, Method::GET, "/api/v1/missions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::POST, "/api/v1/missions/missing/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let decision = json!({
            "approval_id": uuid::Uuid::new_v4(),
            "decision": "approved"
        });
        let (status, _) = call(&app, Method::POST, "/api/v1/approvals/decision", Some(decision)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lifecycle_commands() {
        let (app, state) = app();
        call(&app, Method::POST, "/api/v1/missions", Some(delivery("api-2"))).await;

        let (status, _) = call(&app, Method::POST, "/api/v1/missions/api-2/pause", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, Method::POST, "/api/v1/missions/api-2/abort", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["phase"], "aborted");

        let (status, _) = call(&app, Method::POST, "/api/v1/missions/api-2/abort", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, Method::POST, "/api/v1/missions/api-2/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(state.registry.stats().missions_aborted, 1);
    }

    #[tokio::test]
    async fn test_geojson_import_creates_patrol() {
        let (app, _) = app();
        let request = json!({
            "mission_id": "geo-1",
            "create": true,
            "geojson": {
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "properties": {},
                    "geometry": {
                        "type": "LineString",
                        "coordinates": [[22.676, 49.588], [22.678, 49.590], [22.680, 49.588]]
                    }
                }]
            }
        });

        let (status, body) = call(&app, Method::POST, "/api/v1/playbooks/geojson", Some(request)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["mission_id"], "geo-1");
        assert_eq!(body["playbook"]["mission_type"], "patrol");
        assert_eq!(body["playbook"]["waypoints"][0]["lat"], 49.588);
        assert_eq!(body["playbook"]["waypoints"][0]["action"], "photo");

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/v1/playbooks/geojson",
            Some(json!({"geojson": {"type": "Point"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_metrics_and_ws_info() {
        let (app, _) = app();
        call(&app, Method::POST, "/api/v1/missions", Some(delivery("api-3"))).await;

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
        assert!(text.contains(r#"mission_control_missions{phase="planned"} 1"#));
        assert!(text.contains("mission_control_api_requests_total"));

        let (status, body) = call(&app, Method::GET, "/api/v1/ws/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().contains("/ws/mission/"));
    }
}
