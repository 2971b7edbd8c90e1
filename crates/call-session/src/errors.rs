//! Call session error types.

use signaling_protocol::{ProtocolError, UserId};
use thiserror::Error;

use crate::state::{CallState, EndReason};

/// Errors returned by [`SessionHandle`](crate::SessionHandle) operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// Operation not valid in the current state. Nothing was changed.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    /// Calling yourself.
    #[error("Invalid peer: {0}")]
    InvalidPeer(UserId),

    /// Mic/camera toggled without local media.
    #[error("No local media")]
    NoLocalMedia,

    /// Relay channel is not open.
    #[error("Relay channel closed")]
    ChannelClosed,

    /// Local media could not be acquired. No signaling was sent.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    /// The call ended before the operation completed.
    #[error("Call ended: {0}")]
    CallEnded(EndReason),

    /// Relay connection could not be established.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Controller task or response channel gone.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Local media device failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device busy")]
    DeviceBusy,

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Negotiation engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("negotiation failed: {0}")]
    Failed(String),

    #[error("negotiation engine closed")]
    Closed,
}

impl From<ProtocolError> for NegotiationError {
    fn from(err: ProtocolError) -> Self {
        Self::Failed(err.to_string())
    }
}
