//! Relay error types.
//!
//! Errors never cross the trust boundary to clients: the only client-visible
//! failures are the `user_unreachable` / `user_busy` reply frames. Everything
//! here is logged server-side and, where relevant, counted in drop metrics.

use signaling_protocol::ProtocolError;
use thiserror::Error;

/// Relay service error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Pairing table rejected an operation.
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Outbound frame could not be handed to a channel.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Actor mailbox or response channel closed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Bounded label for the `reason` metric dimension.
    #[must_use]
    pub const fn reason_label(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Protocol(ProtocolError::FrameTooLarge { .. }) => "frame_too_large",
            RelayError::Protocol(_) => "malformed",
            RelayError::Pairing(_) => "pairing",
            RelayError::Delivery(DeliveryError::ChannelFull) => "channel_full",
            RelayError::Delivery(DeliveryError::ChannelClosed) => "channel_closed",
            RelayError::Internal(_) => "internal",
        }
    }
}

/// Pairing table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// One of the users is already paired with a different partner.
    #[error("User {user_id} is already paired")]
    AlreadyPaired { user_id: String },

    /// A user cannot be paired with itself.
    #[error("Cannot pair user {0} with itself")]
    SelfPairing(String),
}

/// Outbound delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Outbound buffer of the target channel is full (slow consumer).
    #[error("Channel buffer full")]
    ChannelFull,

    /// Target channel has already closed.
    #[error("Channel closed")]
    ChannelClosed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_labels_are_bounded() {
        assert_eq!(RelayError::Config("x".to_string()).reason_label(), "config");
        assert_eq!(
            RelayError::Protocol(ProtocolError::Malformed("eof".to_string())).reason_label(),
            "malformed"
        );
        assert_eq!(
            RelayError::Protocol(ProtocolError::FrameTooLarge { len: 10, max: 5 }).reason_label(),
            "frame_too_large"
        );
        assert_eq!(
            RelayError::Delivery(DeliveryError::ChannelFull).reason_label(),
            "channel_full"
        );
        assert_eq!(
            RelayError::Delivery(DeliveryError::ChannelClosed).reason_label(),
            "channel_closed"
        );
        assert_eq!(RelayError::Internal("gone".to_string()).reason_label(), "internal");
    }

    #[test]
    fn test_pairing_error_conversion() {
        let err: RelayError = PairingError::AlreadyPaired {
            user_id: "doc1".to_string(),
        }
        .into();

        assert!(matches!(err, RelayError::Pairing(_)));
        assert_eq!(err.reason_label(), "pairing");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                RelayError::Pairing(PairingError::AlreadyPaired {
                    user_id: "doc1".to_string()
                })
            ),
            "Pairing error: User doc1 is already paired"
        );
        assert_eq!(
            format!("{}", RelayError::Delivery(DeliveryError::ChannelFull)),
            "Delivery error: Channel buffer full"
        );
        assert_eq!(
            format!("{}", PairingError::SelfPairing("pat1".to_string())),
            "Cannot pair user pat1 with itself"
        );
    }
}
