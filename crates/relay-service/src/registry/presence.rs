//! Presence registry: user id to live channel.
//!
//! Exactly one live channel per user (last writer wins). A connection that
//! has been superseded keeps running until its cancel token fires, and its
//! eventual close must not evict the newer registration, so removal on close
//! goes through [`PresenceRegistry::unregister_connection`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use signaling_protocol::{ServerFrame, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::DeliveryError;

/// Outbound side of one client connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    connection_id: Uuid,
    sender: mpsc::Sender<ServerFrame>,
    cancel_token: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl ChannelHandle {
    /// Create a handle for a freshly accepted connection.
    #[must_use]
    pub fn new(
        connection_id: Uuid,
        sender: mpsc::Sender<ServerFrame>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            sender,
            cancel_token,
            connected_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Hand a frame to the connection's writer without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ChannelFull`] when the outbound buffer is
    /// full and [`DeliveryError::ChannelClosed`] when the writer is gone.
    pub fn deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
        })
    }

    /// Ask the owning connection to shut down.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }
}

/// Map of currently connected users.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    endpoints: HashMap<UserId, ChannelHandle>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `handle`, replacing any previous binding.
    ///
    /// Returns the superseded handle when a different connection was bound,
    /// so the caller can close it. Re-registering the same connection
    /// returns `None`.
    pub fn register(&mut self, user_id: UserId, handle: ChannelHandle) -> Option<ChannelHandle> {
        let connection_id = handle.connection_id();
        self.endpoints
            .insert(user_id, handle)
            .filter(|previous| previous.connection_id() != connection_id)
    }

    /// Remove the binding for `user_id`, whichever connection holds it.
    pub fn unregister(&mut self, user_id: &UserId) -> Option<ChannelHandle> {
        self.endpoints.remove(user_id)
    }

    /// Remove the binding only if it still belongs to `connection_id`.
    ///
    /// Returns `true` if a binding was removed.
    pub fn unregister_connection(&mut self, user_id: &UserId, connection_id: Uuid) -> bool {
        let owned = self
            .endpoints
            .get(user_id)
            .is_some_and(|handle| handle.connection_id() == connection_id);
        owned && self.unregister(user_id).is_some()
    }

    #[must_use]
    pub fn lookup(&self, user_id: &UserId) -> Option<&ChannelHandle> {
        self.endpoints.get(user_id)
    }

    /// Currently registered users, sorted for stable output.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.endpoints.keys().cloned().collect();
        users.sort();
        users
    }

    /// Iterate over every live binding.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &ChannelHandle)> {
        self.endpoints.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
