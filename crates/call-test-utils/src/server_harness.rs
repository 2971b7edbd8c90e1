//! Test server harness for E2E testing
//!
//! Provides `TestRelayServer` for spawning real relay instances in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use relay_service::actors::{
    ActorMetrics, ConnectionConfig, RelayActor, RelayActorHandle, RelayStatus, UserPresence,
};
use relay_service::config::Config;
use relay_service::routes::{build_routes, AppState};
use signaling_protocol::UserId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the signaling relay in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_status_e2e() -> anyhow::Result<()> {
///     let server = TestRelayServer::spawn().await?;
///     assert_eq!(server.status().await?.online_users, 0);
///     Ok(())
/// }
/// ```
pub struct TestRelayServer {
    addr: SocketAddr,
    relay: RelayActorHandle,
    metrics: Arc<ActorMetrics>,
    config: Config,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a new relay instance.
    ///
    /// The server will:
    /// - Start its own relay actor
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Serve `/ws` and `/status` in the background
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("RELAY_INSTANCE_ID".to_string(), "relay-test".to_string()),
        ]);
        Self::spawn_with_vars(&vars).await
    }

    /// Spawn with configuration overrides (e.g. `RELAY_CHANNEL_BUFFER`).
    pub async fn spawn_with_vars(vars: &HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let config = Config::from_vars(vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let cancel_token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (relay, _relay_task) = RelayActor::spawn(
            config.instance_id.clone(),
            config.mailbox_buffer,
            cancel_token.clone(),
            Arc::clone(&metrics),
        );

        let state = Arc::new(AppState {
            relay: relay.clone(),
            metrics: Arc::clone(&metrics),
            connection: ConnectionConfig {
                channel_buffer: config.channel_buffer,
                max_frame_bytes: config.max_frame_bytes,
            },
        });
        let app = build_routes(state);

        let listener = tokio::net::TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let shutdown = cancel_token.child_token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                eprintln!("Test relay error: {}", e);
            }
        });

        Ok(Self {
            addr,
            relay,
            metrics,
            config,
            cancel_token,
            _handle: handle,
        })
    }

    /// Base HTTP URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket signaling URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Aggregate relay status. Also a barrier: every frame the relay
    /// accepted before this call has been routed when it returns.
    pub async fn status(&self) -> Result<RelayStatus, anyhow::Error> {
        self.relay
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("status failed: {}", e))
    }

    /// Presence and pairing of one user.
    pub async fn inspect(&self, user_id: &UserId) -> Result<UserPresence, anyhow::Error> {
        self.relay
            .inspect(user_id.clone())
            .await
            .map_err(|e| anyhow::anyhow!("inspect failed: {}", e))
    }

    /// Current partner of `user_id`, if paired.
    pub async fn partner_of(&self, user_id: &UserId) -> Option<UserId> {
        self.inspect(user_id).await.ok().and_then(|p| p.partner)
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self._handle.abort();
    }
}
