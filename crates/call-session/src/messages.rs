//! Session controller mailbox messages.

use signaling_protocol::{ClientFrame, ServerFrame, UserId};
use tokio::sync::{mpsc, oneshot};

use crate::errors::CallError;
use crate::state::CallSnapshot;

pub type Reply = oneshot::Sender<Result<(), CallError>>;

/// Messages handled by the [`SessionController`](crate::SessionController).
#[derive(Debug)]
pub enum ControllerMessage {
    /// Start an outgoing call. Replies once the invite is sent.
    Initiate { peer_id: UserId, respond_to: Reply },

    /// Accept the ringing call. Replies once the accept is sent.
    Accept { respond_to: Reply },

    Reject { respond_to: Reply },

    End { respond_to: Reply },

    ToggleMic { enabled: bool, respond_to: Reply },

    ToggleCamera { enabled: bool, respond_to: Reply },

    Snapshot {
        respond_to: oneshot::Sender<CallSnapshot>,
    },

    /// The relay connection is up; outbound signaling goes to `outbound`.
    ChannelOpened { outbound: mpsc::Sender<ClientFrame> },

    /// The relay connection behind `outbound` closed.
    ChannelClosed { outbound: mpsc::Sender<ClientFrame> },

    /// A frame received from the relay.
    Inbound(ServerFrame),
}
