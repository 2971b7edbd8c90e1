//! Signaling messages and the frames that carry them.
//!
//! Negotiation payloads are held as raw JSON text and re-emitted byte for
//! byte, so decoding goes through flat wire structs rather than serde's
//! tagged-enum buffering (which would parse the payload into a tree).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::codec::ProtocolError;
use crate::types::{CallerProfile, UserId};

/// Opaque negotiation payload (session description or candidate).
///
/// The relay forwards it unmodified and never inspects its contents: the
/// exact JSON text received is the text sent on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationBlob(Box<RawValue>);

impl NegotiationBlob {
    /// Wrap JSON text, checking only that it is a single well-formed value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if `json` is not valid JSON.
    pub fn from_json(json: impl Into<String>) -> Result<Self, ProtocolError> {
        RawValue::from_string(json.into())
            .map(Self)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize `value` into a blob.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if `value` cannot be serialized.
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::value::to_raw_value(value)
            .map(Self)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse the blob into a typed value (endpoint side only).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(self.0.get()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// The payload's JSON text exactly as received.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    /// Serialized size of the blob in bytes (for logging without contents).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.0.get().len()
    }
}

impl PartialEq for NegotiationBlob {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for NegotiationBlob {}

/// A session-control or negotiation message between two endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", try_from = "WireMessage")]
pub enum SignalingMessage {
    /// Request to start a call, carrying the caller's profile summary.
    Invite {
        from: UserId,
        to: UserId,
        caller: CallerProfile,
    },
    Accept {
        from: UserId,
        to: UserId,
    },
    Reject {
        from: UserId,
        to: UserId,
    },
    End {
        from: UserId,
        to: UserId,
    },
    NegotiationOffer {
        from: UserId,
        to: UserId,
        offer: NegotiationBlob,
    },
    NegotiationAnswer {
        from: UserId,
        to: UserId,
        answer: NegotiationBlob,
    },
    NegotiationCandidate {
        from: UserId,
        to: UserId,
        candidate: NegotiationBlob,
    },
}

impl SignalingMessage {
    /// The sending endpoint.
    #[must_use]
    pub fn from(&self) -> &UserId {
        match self {
            Self::Invite { from, .. }
            | Self::Accept { from, .. }
            | Self::Reject { from, .. }
            | Self::End { from, .. }
            | Self::NegotiationOffer { from, .. }
            | Self::NegotiationAnswer { from, .. }
            | Self::NegotiationCandidate { from, .. } => from,
        }
    }

    /// The intended receiving endpoint.
    #[must_use]
    pub fn to(&self) -> &UserId {
        match self {
            Self::Invite { to, .. }
            | Self::Accept { to, .. }
            | Self::Reject { to, .. }
            | Self::End { to, .. }
            | Self::NegotiationOffer { to, .. }
            | Self::NegotiationAnswer { to, .. }
            | Self::NegotiationCandidate { to, .. } => to,
        }
    }

    /// Discriminant of the message, for routing decisions and metric labels.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Invite { .. } => MessageKind::Invite,
            Self::Accept { .. } => MessageKind::Accept,
            Self::Reject { .. } => MessageKind::Reject,
            Self::End { .. } => MessageKind::End,
            Self::NegotiationOffer { .. } => MessageKind::NegotiationOffer,
            Self::NegotiationAnswer { .. } => MessageKind::NegotiationAnswer,
            Self::NegotiationCandidate { .. } => MessageKind::NegotiationCandidate,
        }
    }
}

/// Payload-free discriminant of [`SignalingMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Invite,
    Accept,
    Reject,
    End,
    NegotiationOffer,
    NegotiationAnswer,
    NegotiationCandidate,
}

impl MessageKind {
    /// Bounded label value (7 kinds).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Invite => "invite",
            MessageKind::Accept => "accept",
            MessageKind::Reject => "reject",
            MessageKind::End => "end",
            MessageKind::NegotiationOffer => "negotiation_offer",
            MessageKind::NegotiationAnswer => "negotiation_answer",
            MessageKind::NegotiationCandidate => "negotiation_candidate",
        }
    }

    /// Whether this kind carries an opaque negotiation payload.
    #[must_use]
    pub const fn is_negotiation(&self) -> bool {
        matches!(
            self,
            MessageKind::NegotiationOffer
                | MessageKind::NegotiationAnswer
                | MessageKind::NegotiationCandidate
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat decoding form of [`SignalingMessage`].
#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    from: UserId,
    to: UserId,
    caller: Option<CallerProfile>,
    offer: Option<NegotiationBlob>,
    answer: Option<NegotiationBlob>,
    candidate: Option<NegotiationBlob>,
}

fn required<T>(field: Option<T>, name: &str, kind: MessageKind) -> Result<T, String> {
    field.ok_or_else(|| format!("missing field `{name}` for {kind}"))
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let WireMessage {
            kind,
            from,
            to,
            caller,
            offer,
            answer,
            candidate,
        } = wire;

        Ok(match kind {
            MessageKind::Invite => Self::Invite {
                from,
                to,
                caller: required(caller, "caller", kind)?,
            },
            MessageKind::Accept => Self::Accept { from, to },
            MessageKind::Reject => Self::Reject { from, to },
            MessageKind::End => Self::End { from, to },
            MessageKind::NegotiationOffer => Self::NegotiationOffer {
                from,
                to,
                offer: required(offer, "offer", kind)?,
            },
            MessageKind::NegotiationAnswer => Self::NegotiationAnswer {
                from,
                to,
                answer: required(answer, "answer", kind)?,
            },
            MessageKind::NegotiationCandidate => Self::NegotiationCandidate {
                from,
                to,
                candidate: required(candidate, "candidate", kind)?,
            },
        })
    }
}

/// Body of the `online` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlinePayload {
    pub user_id: UserId,
}

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    try_from = "Envelope"
)]
pub enum ClientFrame {
    /// Announce the authenticated user behind this channel.
    Online(OnlinePayload),
    /// A signaling message to route to another user.
    Signal(SignalingMessage),
}

impl ClientFrame {
    #[must_use]
    pub fn online(user_id: UserId) -> Self {
        Self::Online(OnlinePayload { user_id })
    }
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    try_from = "Envelope"
)]
pub enum ServerFrame {
    /// The channel is now the live endpoint for `user_id`.
    Registered { user_id: UserId },
    /// A signaling message forwarded from another user.
    Signal(SignalingMessage),
    /// Reply to an invite whose target has no live channel.
    UserUnreachable { user_id: UserId },
    /// Reply to an invite whose target (or sender) is already paired.
    UserBusy { user_id: UserId },
    /// Another user came online or went offline.
    PresenceChanged { user_id: UserId, online: bool },
}

/// Decoding form of a frame: the event name and its still-unparsed body.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    data: Box<RawValue>,
}

impl Envelope {
    fn body<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_str(self.data.get()).map_err(|e| format!("{}: {e}", self.event))
    }

    fn unknown<T>(&self) -> Result<T, String> {
        Err(format!("unknown event `{}`", self.event))
    }
}

#[derive(Deserialize)]
struct UserBody {
    user_id: UserId,
}

#[derive(Deserialize)]
struct PresenceBody {
    user_id: UserId,
    online: bool,
}

impl TryFrom<Envelope> for ClientFrame {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.event.as_str() {
            "online" => envelope.body().map(Self::Online),
            "signal" => envelope.body().map(Self::Signal),
            _ => envelope.unknown(),
        }
    }
}

impl TryFrom<Envelope> for ServerFrame {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.event.as_str() {
            "registered" => envelope
                .body()
                .map(|UserBody { user_id }| Self::Registered { user_id }),
            "signal" => envelope.body().map(Self::Signal),
            "user_unreachable" => envelope
                .body()
                .map(|UserBody { user_id }| Self::UserUnreachable { user_id }),
            "user_busy" => envelope
                .body()
                .map(|UserBody { user_id }| Self::UserBusy { user_id }),
            "presence_changed" => envelope
                .body()
                .map(|PresenceBody { user_id, online }| Self::PresenceChanged { user_id, online }),
            _ => envelope.unknown(),
        }
    }
}
