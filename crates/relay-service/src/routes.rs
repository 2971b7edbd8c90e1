//! HTTP routes for the relay.
//!
//! Signaling listener:
//! - `GET /ws` - WebSocket signaling channel
//! - `GET /status` - Online user and pairing counts (also at `/api/health`)
//!
//! Health listener (see [`build_health_routes`]):
//! - `GET /health`, `GET /ready` - probes
//! - `GET /metrics` - Prometheus text format

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::actors::{ActorMetrics, ConnectionConfig, RelayActorHandle, RelayStatus};
use crate::observability::{health_router, HealthState};
use crate::transport::ws_handler;

/// Application state shared across signaling handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayActorHandle,
    pub metrics: Arc<ActorMetrics>,
    pub connection: ConnectionConfig,
}

/// Build the signaling router.
pub fn build_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .route("/api/health", get(status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build the health/metrics router.
pub fn build_health_routes(health_state: Arc<HealthState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    health_router(health_state).merge(metrics_routes)
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RelayStatus>, StatusCode> {
    state.relay.status().await.map(Json).map_err(|e| {
        warn!(target: "relay.routes", error = %e, "Status unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::RelayActor;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn test_state() -> (Arc<AppState>, RelayActorHandle) {
        let metrics = ActorMetrics::new();
        let (relay, _task) = RelayActor::spawn(
            "relay-routes-test".to_string(),
            16,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        let state = Arc::new(AppState {
            relay: relay.clone(),
            metrics,
            connection: ConnectionConfig {
                channel_buffer: 8,
                max_frame_bytes: 1024,
            },
        });
        (state, relay)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_counts() {
        let (state, _relay) = test_state();

        let (status, body) = get_json(build_routes(state), "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instance_id"], "relay-routes-test");
        assert_eq!(body["online_users"], 0);
        assert_eq!(body["active_pairings"], 0);
    }

    #[tokio::test]
    async fn test_legacy_health_path_serves_status() {
        let (state, _relay) = test_state();
        let (status, body) = get_json(build_routes(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_unavailable_after_relay_stops() {
        let (state, relay) = test_state();
        relay.cancel();
        // Let the actor observe cancellation and drop its mailbox.
        while relay.status().await.is_ok() {
            tokio::task::yield_now().await;
        }

        let (status, _) = get_json(build_routes(state), "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let (state, _relay) = test_state();
        let (status, _) = get_json(build_routes(state), "/ws").await;
        assert!(status.is_client_error());
    }
}
