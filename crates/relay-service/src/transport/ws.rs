//! WebSocket upgrade handler.
//!
//! Each upgraded socket is served by its own [`ConnectionActor`] on the task
//! axum spawns for the upgrade.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

use crate::actors::ConnectionActor;
use crate::routes::AppState;

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!(target: "relay.ws", "WebSocket upgrade requested");

    let relay = state.relay.clone();
    let metrics = Arc::clone(&state.metrics);
    let config = state.connection;

    ws.on_failed_upgrade(|e| {
        debug!(target: "relay.ws", error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| ConnectionActor::serve(socket, relay, config, metrics))
}
