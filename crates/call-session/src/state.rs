//! Call state, snapshots and events published to the UI layer.

use std::fmt;

use signaling_protocol::{CallerProfile, UserId};

use crate::negotiation::RemoteMedia;

/// Local call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    /// Outgoing invite pending (media being acquired or waiting on the peer).
    Calling,
    /// Incoming invite awaiting a local decision.
    Ringing,
    /// Accepted; negotiation in progress.
    Connecting,
    Connected,
    /// Terminal. Published once, then the controller resets to `Idle`.
    Ended,
}

impl CallState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// States in which a peer is set and the relay holds a pairing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connecting | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side started the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Sends the invite and the negotiation offer.
    Initiator,
    /// Receives the invite and answers the offer.
    Responder,
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Peer rejected the invite.
    Rejected,
    /// Local user declined the incoming call.
    Declined,
    /// Peer had no live connection.
    Unreachable,
    /// Peer was already in a call.
    Busy,
    /// No media path could be established.
    NegotiationFailed,
    RemoteEnded,
    LocalEnded,
    /// Relay connection lost.
    ChannelClosed,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::Rejected => "rejected",
            EndReason::Declined => "declined",
            EndReason::Unreachable => "unreachable",
            EndReason::Busy => "busy",
            EndReason::NegotiationFailed => "negotiation failed",
            EndReason::RemoteEnded => "remote ended",
            EndReason::LocalEnded => "local ended",
            EndReason::ChannelClosed => "channel closed",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the controller's call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Attempt number; `None` when idle.
    pub call_id: Option<u64>,
    pub state: CallState,
    pub peer_id: Option<UserId>,
    /// Caller's profile, set on the responder side.
    pub peer_profile: Option<CallerProfile>,
    pub role: Option<CallRole>,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    /// Id of the local media stream, if acquired.
    pub local_media: Option<String>,
    pub remote_media: Option<RemoteMedia>,
}

impl CallSnapshot {
    /// Snapshot of a fresh session.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            call_id: None,
            state: CallState::Idle,
            peer_id: None,
            peer_profile: None,
            role: None,
            mic_enabled: true,
            camera_enabled: true,
            local_media: None,
            remote_media: None,
        }
    }

    /// Snapshot published on the terminal transition: peer and media cleared.
    #[must_use]
    pub fn ended(call_id: u64) -> Self {
        Self {
            call_id: Some(call_id),
            state: CallState::Ended,
            ..Self::idle()
        }
    }
}

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Any change visible in the snapshot.
    StateChanged(CallSnapshot),
    /// An invite arrived; the UI should prompt the user.
    IncomingCall { caller: CallerProfile },
    /// A call reached `Ended`.
    CallEnded { peer_id: UserId, reason: EndReason },
}
