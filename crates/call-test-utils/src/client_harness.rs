//! Session controller harness connected to a [`TestRelayServer`].

use std::sync::Arc;
use std::time::Duration;

use call_session::testing::{MockMediaDevices, MockNegotiationFactory};
use call_session::{
    CallEvent, CallSnapshot, CallState, EndReason, RelayConnection, SessionConfig,
    SessionController, SessionHandle,
};
use signaling_protocol::{CallerProfile, UserId, UserRole};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::server_harness::TestRelayServer;
use crate::uid;

/// How long assertion helpers wait for an event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// A user with a running controller, mock media and a live relay connection.
pub struct TestClient {
    user_id: UserId,
    handle: SessionHandle,
    events: broadcast::Receiver<CallEvent>,
    connection: Option<RelayConnection>,
    config: SessionConfig,
    devices: Arc<MockMediaDevices>,
    factory: Arc<MockNegotiationFactory>,
    cancel_token: CancellationToken,
}

impl TestClient {
    /// Connect `user` with auto-connecting mock media.
    pub async fn connect(server: &TestRelayServer, user: &str) -> Result<Self, anyhow::Error> {
        Self::connect_with(
            server,
            user,
            MockMediaDevices::new(),
            MockNegotiationFactory::new(),
        )
        .await
    }

    pub async fn connect_with(
        server: &TestRelayServer,
        user: &str,
        devices: MockMediaDevices,
        factory: MockNegotiationFactory,
    ) -> Result<Self, anyhow::Error> {
        let mut client = Self::spawn(server, user, devices, factory);
        client.reconnect().await?;
        Ok(client)
    }

    /// Controller only; call [`TestClient::reconnect`] to go online.
    pub fn spawn(
        server: &TestRelayServer,
        user: &str,
        devices: MockMediaDevices,
        factory: MockNegotiationFactory,
    ) -> Self {
        let config = SessionConfig {
            relay_url: server.ws_url(),
            ..SessionConfig::default()
        };
        let devices = Arc::new(devices);
        let factory = Arc::new(factory);
        let cancel_token = CancellationToken::new();

        let role = if user.starts_with("doc") {
            UserRole::Doctor
        } else {
            UserRole::Patient
        };
        let profile = CallerProfile::new(uid(user), format!("Test {user}"), role);

        let (handle, _task) = SessionController::spawn(
            profile,
            &config,
            devices.clone(),
            factory.clone(),
            cancel_token.clone(),
        );
        let events = handle.subscribe();

        Self {
            user_id: uid(user),
            handle,
            events,
            connection: None,
            config,
            devices,
            factory,
            cancel_token,
        }
    }

    /// Open a (new) relay connection. Supersedes any previous one.
    pub async fn reconnect(&mut self) -> Result<(), anyhow::Error> {
        let connection = RelayConnection::connect(&self.config, self.handle.clone())
            .await
            .map_err(|e| anyhow::anyhow!("relay connect failed: {}", e))?;
        if let Some(previous) = self.connection.replace(connection) {
            previous.close();
        }
        Ok(())
    }

    /// Drop the relay connection abruptly.
    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            connection.closed().await;
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn devices(&self) -> &MockMediaDevices {
        &self.devices
    }

    pub fn factory(&self) -> &MockNegotiationFactory {
        &self.factory
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        self.handle.snapshot().await.expect("controller alive")
    }

    /// Next event, failing the test after [`EVENT_TIMEOUT`].
    pub async fn next_event(&mut self) -> CallEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for event", self.user_id))
            .expect("event stream open")
    }

    /// Wait until a snapshot with `state` is published.
    pub async fn wait_state(&mut self, state: CallState) -> CallSnapshot {
        loop {
            if let CallEvent::StateChanged(snapshot) = self.next_event().await {
                if snapshot.state == state {
                    return snapshot;
                }
            }
        }
    }

    /// Wait for an incoming-call prompt; returns the caller.
    pub async fn wait_incoming(&mut self) -> CallerProfile {
        loop {
            if let CallEvent::IncomingCall { caller } = self.next_event().await {
                return caller;
            }
        }
    }

    /// Wait for the call to end; returns the peer and reason.
    pub async fn wait_ended(&mut self) -> (UserId, EndReason) {
        loop {
            if let CallEvent::CallEnded { peer_id, reason } = self.next_event().await {
                return (peer_id, reason);
            }
        }
    }

    /// Assert no call ends within `window`.
    pub async fn expect_no_end(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(event) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            match event {
                Ok(CallEvent::CallEnded { peer_id, reason }) => {
                    panic!("{}: unexpected end with {peer_id}: {reason}", self.user_id);
                }
                Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
        self.cancel_token.cancel();
    }
}
