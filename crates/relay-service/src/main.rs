//! Signaling Relay
//!
//! WebSocket relay for call setup between two clients.
//!
//! # Servers
//!
//! - Signaling server: `/ws`, `/status` (default: 0.0.0.0:5000)
//! - Health server: `/health`, `/ready`, `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the relay actor
//! 4. Bind and start the health server
//! 5. Bind and start the signaling server, mark ready
//! 6. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_service::actors::{ActorMetrics, ConnectionConfig, RelayActor};
use relay_service::config::Config;
use relay_service::errors::RelayError;
use relay_service::observability::metrics::init_metrics_recorder;
use relay_service::observability::HealthState;
use relay_service::routes::{build_health_routes, build_routes, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the relay actor gets to drain after shutdown begins.
const ACTOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signaling Relay");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        RelayError::Config(e.to_string())
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        channel_buffer = config.channel_buffer,
        mailbox_buffer = config.mailbox_buffer,
        max_frame_bytes = config.max_frame_bytes,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let actor_metrics = ActorMetrics::new();

    let root_token = CancellationToken::new();
    let (relay_handle, relay_task) = RelayActor::spawn(
        config.instance_id.clone(),
        config.mailbox_buffer,
        root_token.clone(),
        Arc::clone(&actor_metrics),
    );

    // Health server
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_app = build_health_routes(Arc::clone(&health_state), prometheus_handle);
    let health_shutdown_token = root_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let bind_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let listener = tokio::net::TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(error = %e, addr = %bind_addr, "Failed to bind signaling server");
        format!("Failed to bind signaling server to {bind_addr}: {e}")
    })?;

    let state = Arc::new(AppState {
        relay: relay_handle.clone(),
        metrics: Arc::clone(&actor_metrics),
        connection: ConnectionConfig {
            channel_buffer: config.channel_buffer,
            max_frame_bytes: config.max_frame_bytes,
        },
    });
    let app = build_routes(state);

    let signaling_shutdown_token = root_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %bind_addr, "Signaling server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            signaling_shutdown_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Signaling Relay running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending upgrades
    health_state.set_not_ready();

    // Propagates to the relay actor, every connection, and both servers
    root_token.cancel();

    if tokio::time::timeout(ACTOR_DRAIN_TIMEOUT, relay_task)
        .await
        .is_err()
    {
        warn!("Relay actor did not drain before timeout");
    }
    let _ = signaling_task.await;

    info!("Signaling Relay shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
