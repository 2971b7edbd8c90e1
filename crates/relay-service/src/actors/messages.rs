//! Relay actor mailbox messages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use signaling_protocol::{SignalingMessage, UserId};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::registry::ChannelHandle;

/// Messages handled by the [`RelayActor`](super::RelayActor).
#[derive(Debug)]
pub enum RelayMessage {
    /// Bind a user to a connection (client sent `online`).
    Register {
        user_id: UserId,
        handle: ChannelHandle,
    },

    /// A connection closed.
    Disconnect {
        user_id: UserId,
        connection_id: Uuid,
    },

    /// Route a signaling message received on `connection_id`.
    Route {
        connection_id: Uuid,
        message: SignalingMessage,
    },

    /// Presence and pairing state of one user.
    Inspect {
        user_id: UserId,
        respond_to: oneshot::Sender<UserPresence>,
    },

    /// Aggregate counts for `/status`.
    GetStatus {
        respond_to: oneshot::Sender<RelayStatus>,
    },
}

/// What the relay knows about one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPresence {
    pub connection_id: Option<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
    pub partner: Option<UserId>,
}

impl UserPresence {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connection_id.is_some()
    }
}

/// Relay summary served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub status: &'static str,
    pub instance_id: String,
    pub online_users: usize,
    pub active_pairings: usize,
    pub active_connections: usize,
    pub messages_processed: u64,
}
