//! Signaling routing policy.
//!
//! [`SignalingRelay`] owns the presence registry and the pairing table and
//! decides, per message kind, whether a message is forwarded, answered, or
//! dropped. It performs no I/O beyond non-blocking hand-off to channel
//! buffers, so the relay actor can run it inline for every mailbox message.
//!
//! | Kind | Policy |
//! |------|--------|
//! | Invite | target offline or not accepting frames: reply `user_unreachable`; pairing conflict: reply `user_busy`; else pair and forward |
//! | Accept | forward to the sender's partner |
//! | Reject, End | unpair, then forward to the former partner |
//! | Negotiation | forward only when `to` is the sender's partner |

use signaling_protocol::{MessageKind, ServerFrame, SignalingMessage, UserId};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{DeliveryError, PairingError};
use crate::registry::{ChannelHandle, PairingTable, PresenceRegistry};

/// Why a message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Sender's `from` is not the user bound to the originating connection.
    Unauthenticated,
    /// Sender has no active pairing (stale session-control message).
    NoPartner,
    /// `to` does not match the sender's current partner.
    StalePeer,
    /// Invite addressed to the sender itself.
    SelfInvite,
    /// Partner is paired but no longer connected.
    PeerOffline,
    /// Target's outbound buffer was full.
    ChannelFull,
    /// Target's writer has gone away.
    ChannelClosed,
}

impl DropReason {
    /// Bounded label for the `reason` metric dimension.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unauthenticated => "unauthenticated",
            DropReason::NoPartner => "no_partner",
            DropReason::StalePeer => "stale_peer",
            DropReason::SelfInvite => "self_invite",
            DropReason::PeerOffline => "peer_offline",
            DropReason::ChannelFull => "channel_full",
            DropReason::ChannelClosed => "channel_closed",
        }
    }
}

impl From<DeliveryError> for DropReason {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::ChannelFull => DropReason::ChannelFull,
            DeliveryError::ChannelClosed => DropReason::ChannelClosed,
        }
    }
}

/// Result of routing one signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Message handed to the target's channel.
    Forwarded { to: UserId },
    /// Invite target has no live channel; sender was told.
    Unreachable,
    /// Invite target or sender already paired elsewhere; sender was told.
    Busy,
    /// Message discarded.
    Dropped(DropReason),
}

/// Result of binding a connection to a user.
#[derive(Debug)]
pub struct Registration {
    /// Previous connection for the same user, to be closed by the caller.
    pub superseded: Option<ChannelHandle>,
}

/// Result of a connection closing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Departure {
    /// Whether the closing connection was the live one for its user.
    pub was_live: bool,
    /// Former partner that was sent an `end`.
    pub notified_partner: Option<UserId>,
}

/// Routing core shared by every connection through the relay actor.
#[derive(Debug, Default)]
pub struct SignalingRelay {
    presence: PresenceRegistry,
    pairings: PairingTable,
}

impl SignalingRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    #[must_use]
    pub fn pairings(&self) -> &PairingTable {
        &self.pairings
    }

    /// Bind `user_id` to a connection, acknowledge it, and announce the
    /// user to everyone else.
    pub fn register(&mut self, user_id: &UserId, handle: ChannelHandle) -> Registration {
        let ack = handle.deliver(ServerFrame::Registered {
            user_id: user_id.clone(),
        });
        if let Err(e) = ack {
            debug!(
                target: "relay.routing",
                user_id = %user_id,
                error = %e,
                "Registration acknowledgement not delivered"
            );
        }

        let superseded = self.presence.register(user_id.clone(), handle);
        self.broadcast_presence(user_id, true);

        Registration { superseded }
    }

    /// Handle a connection closing.
    ///
    /// Only the live connection for a user tears down its pairing; a
    /// superseded connection closing leaves the newer one untouched.
    pub fn disconnect(&mut self, user_id: &UserId, connection_id: Uuid) -> Departure {
        if !self.presence.unregister_connection(user_id, connection_id) {
            return Departure::default();
        }

        let notified_partner = self.pairings.unpair(user_id);
        if let Some(partner) = &notified_partner {
            let end = SignalingMessage::End {
                from: user_id.clone(),
                to: partner.clone(),
            };
            if let Err(reason) = self.deliver_to(partner, ServerFrame::Signal(end)) {
                debug!(
                    target: "relay.routing",
                    user_id = %user_id,
                    partner = %partner,
                    reason = reason.as_str(),
                    "Disconnect end not delivered"
                );
            }
        }

        self.broadcast_presence(user_id, false);

        Departure {
            was_live: true,
            notified_partner,
        }
    }

    /// Route a message received on `connection_id`.
    pub fn route(&mut self, connection_id: Uuid, message: SignalingMessage) -> RouteOutcome {
        let bound = self
            .presence
            .lookup(message.from())
            .is_some_and(|h| h.connection_id() == connection_id);
        if !bound {
            return RouteOutcome::Dropped(DropReason::Unauthenticated);
        }

        match message.kind() {
            MessageKind::Invite => self.route_invite(message),
            MessageKind::Accept => self.route_to_partner(message, false),
            MessageKind::Reject | MessageKind::End => self.route_to_partner(message, true),
            MessageKind::NegotiationOffer
            | MessageKind::NegotiationAnswer
            | MessageKind::NegotiationCandidate => self.route_to_partner(message, false),
        }
    }

    fn route_invite(&mut self, message: SignalingMessage) -> RouteOutcome {
        let from = message.from().clone();
        let to = message.to().clone();

        if self.presence.lookup(&to).is_none() {
            self.reply(&from, ServerFrame::UserUnreachable { user_id: to });
            return RouteOutcome::Unreachable;
        }

        match self.pairings.pair(&from, &to) {
            Ok(()) => {}
            Err(PairingError::AlreadyPaired { .. }) => {
                self.reply(&from, ServerFrame::UserBusy { user_id: to });
                return RouteOutcome::Busy;
            }
            Err(PairingError::SelfPairing(_)) => {
                return RouteOutcome::Dropped(DropReason::SelfInvite);
            }
        }

        match self.deliver_to(&to, ServerFrame::Signal(message)) {
            Ok(()) => RouteOutcome::Forwarded { to },
            Err(reason) => {
                // The callee never saw the invite, so neither side may stay paired.
                self.pairings.unpair(&from);
                debug!(
                    target: "relay.routing",
                    from = %from,
                    to = %to,
                    reason = reason.as_str(),
                    "Invite undeliverable, pairing released"
                );
                self.reply(&from, ServerFrame::UserUnreachable { user_id: to });
                RouteOutcome::Unreachable
            }
        }
    }

    /// Forward a message to the sender's current partner.
    ///
    /// Messages whose `to` disagrees with the pairing are stale leftovers
    /// of an earlier call and are dropped.
    fn route_to_partner(&mut self, message: SignalingMessage, terminates: bool) -> RouteOutcome {
        let Some(partner) = self.pairings.partner_of(message.from()).cloned() else {
            return RouteOutcome::Dropped(DropReason::NoPartner);
        };
        if &partner != message.to() {
            return RouteOutcome::Dropped(DropReason::StalePeer);
        }

        if terminates {
            self.pairings.unpair(message.from());
        }

        match self.deliver_to(&partner, ServerFrame::Signal(message)) {
            Ok(()) => RouteOutcome::Forwarded { to: partner },
            Err(reason) => RouteOutcome::Dropped(reason),
        }
    }

    fn deliver_to(&self, user_id: &UserId, frame: ServerFrame) -> Result<(), DropReason> {
        let handle = self
            .presence
            .lookup(user_id)
            .ok_or(DropReason::PeerOffline)?;
        handle.deliver(frame).map_err(DropReason::from)
    }

    fn reply(&self, user_id: &UserId, frame: ServerFrame) {
        if let Err(reason) = self.deliver_to(user_id, frame) {
            debug!(
                target: "relay.routing",
                user_id = %user_id,
                reason = reason.as_str(),
                "Reply not delivered"
            );
        }
    }

    fn broadcast_presence(&self, user_id: &UserId, online: bool) {
        for (other, handle) in self.presence.iter() {
            if other == user_id {
                continue;
            }
            let frame = ServerFrame::PresenceChanged {
                user_id: user_id.clone(),
                online,
            };
            if let Err(e) = handle.deliver(frame) {
                debug!(
                    target: "relay.routing",
                    user_id = %other,
                    error = %e,
                    "Presence update not delivered"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use signaling_protocol::{CallerProfile, NegotiationBlob, UserRole};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    struct Peer {
        user: UserId,
        connection_id: Uuid,
        rx: mpsc::Receiver<ServerFrame>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<ServerFrame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn signals(&mut self) -> Vec<SignalingMessage> {
            self.drain()
                .into_iter()
                .filter_map(|f| match f {
                    ServerFrame::Signal(m) => Some(m),
                    _ => None,
                })
                .collect()
        }
    }

    fn connect(relay: &mut SignalingRelay, name: &str) -> Peer {
        connect_with_buffer(relay, name, 32)
    }

    fn connect_with_buffer(relay: &mut SignalingRelay, name: &str, buffer: usize) -> Peer {
        let (tx, rx) = mpsc::channel(buffer);
        let connection_id = Uuid::new_v4();
        let user = uid(name);
        relay.register(
            &user,
            ChannelHandle::new(connection_id, tx, CancellationToken::new()),
        );
        let mut peer = Peer {
            user,
            connection_id,
            rx,
        };
        peer.drain();
        peer
    }

    fn invite(from: &Peer, to: &Peer) -> SignalingMessage {
        SignalingMessage::Invite {
            from: from.user.clone(),
            to: to.user.clone(),
            caller: CallerProfile::new(from.user.clone(), "Caller", UserRole::Patient),
        }
    }

    fn end(from: &Peer, to: &Peer) -> SignalingMessage {
        SignalingMessage::End {
            from: from.user.clone(),
            to: to.user.clone(),
        }
    }

    fn candidate(from: &Peer, to: &Peer, n: u32) -> SignalingMessage {
        SignalingMessage::NegotiationCandidate {
            from: from.user.clone(),
            to: to.user.clone(),
            candidate: NegotiationBlob::from_value(&json!({ "candidate": n })).unwrap(),
        }
    }

    #[test]
    fn test_register_acknowledges_and_broadcasts_presence() {
        let mut relay = SignalingRelay::new();
        let mut doc = connect(&mut relay, "doc1");

        let (tx, mut rx) = mpsc::channel(8);
        relay.register(
            &uid("pat1"),
            ChannelHandle::new(Uuid::new_v4(), tx, CancellationToken::new()),
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerFrame::Registered {
                user_id: uid("pat1")
            }
        );
        assert_eq!(
            doc.drain(),
            vec![ServerFrame::PresenceChanged {
                user_id: uid("pat1"),
                online: true
            }]
        );
    }

    #[test]
    fn test_invite_to_offline_user_replies_unreachable() {
        let mut relay = SignalingRelay::new();
        let mut pat = connect(&mut relay, "pat1");
        let msg = SignalingMessage::Invite {
            from: pat.user.clone(),
            to: uid("doc1"),
            caller: CallerProfile::new(pat.user.clone(), "Asha", UserRole::Patient),
        };

        assert_eq!(relay.route(pat.connection_id, msg), RouteOutcome::Unreachable);
        assert_eq!(
            pat.drain(),
            vec![ServerFrame::UserUnreachable {
                user_id: uid("doc1")
            }]
        );
        assert!(relay.pairings().is_empty());
    }

    #[test]
    fn test_invite_pairs_and_forwards() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");

        let outcome = relay.route(pat.connection_id, invite(&pat, &doc));

        assert_eq!(outcome, RouteOutcome::Forwarded { to: uid("doc1") });
        assert_eq!(relay.pairings().partner_of(&pat.user), Some(&doc.user));
        assert_eq!(doc.signals(), vec![invite(&pat, &doc)]);
    }

    #[test]
    fn test_second_invite_to_paired_user_is_busy() {
        let mut relay = SignalingRelay::new();
        let pat1 = connect(&mut relay, "pat1");
        let mut pat2 = connect(&mut relay, "pat2");
        let mut doc = connect(&mut relay, "doc1");

        relay.route(pat1.connection_id, invite(&pat1, &doc));
        doc.drain();

        let outcome = relay.route(pat2.connection_id, invite(&pat2, &doc));

        assert_eq!(outcome, RouteOutcome::Busy);
        assert_eq!(
            pat2.drain(),
            vec![ServerFrame::UserBusy {
                user_id: uid("doc1")
            }]
        );
        assert!(doc.drain().is_empty());
        assert_eq!(relay.pairings().partner_of(&doc.user), Some(&pat1.user));
    }

    #[test]
    fn test_self_invite_dropped() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");

        let outcome = relay.route(pat.connection_id, invite(&pat, &pat));
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::SelfInvite));
    }

    #[test]
    fn test_message_from_wrong_connection_is_dropped() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");

        let outcome = relay.route(Uuid::new_v4(), invite(&pat, &doc));

        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::Unauthenticated));
        assert!(doc.drain().is_empty());
        assert!(relay.pairings().is_empty());
    }

    #[test]
    fn test_end_unpairs_and_forwards() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");
        relay.route(pat.connection_id, invite(&pat, &doc));
        doc.drain();

        let outcome = relay.route(doc.connection_id, end(&doc, &pat));

        assert_eq!(outcome, RouteOutcome::Forwarded { to: uid("pat1") });
        assert!(relay.pairings().is_empty());
    }

    #[test]
    fn test_stale_end_without_pairing_is_dropped() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let doc = connect(&mut relay, "doc1");

        let outcome = relay.route(pat.connection_id, end(&pat, &doc));
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::NoPartner));
    }

    #[test]
    fn test_end_addressed_to_non_partner_is_dropped() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let doc = connect(&mut relay, "doc1");
        let other = connect(&mut relay, "doc2");
        relay.route(pat.connection_id, invite(&pat, &doc));

        let outcome = relay.route(pat.connection_id, end(&pat, &other));

        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::StalePeer));
        assert_eq!(relay.pairings().partner_of(&pat.user), Some(&doc.user));
    }

    #[test]
    fn test_negotiation_requires_pairing() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");

        assert_eq!(
            relay.route(pat.connection_id, candidate(&pat, &doc, 1)),
            RouteOutcome::Dropped(DropReason::NoPartner)
        );

        relay.route(pat.connection_id, invite(&pat, &doc));
        doc.drain();

        assert_eq!(
            relay.route(pat.connection_id, candidate(&pat, &doc, 2)),
            RouteOutcome::Forwarded { to: uid("doc1") }
        );
        assert_eq!(doc.signals(), vec![candidate(&pat, &doc, 2)]);
    }

    #[test]
    fn test_forwarding_preserves_order() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");
        relay.route(pat.connection_id, invite(&pat, &doc));
        doc.drain();

        for n in 0..10 {
            relay.route(pat.connection_id, candidate(&pat, &doc, n));
        }

        let expected: Vec<_> = (0..10).map(|n| candidate(&pat, &doc, n)).collect();
        assert_eq!(doc.signals(), expected);
    }

    #[test]
    fn test_full_channel_drops_frame() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let doc = connect_with_buffer(&mut relay, "doc1", 1);
        relay.route(pat.connection_id, invite(&pat, &doc));

        let outcome = relay.route(pat.connection_id, candidate(&pat, &doc, 1));
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::ChannelFull));
    }

    #[test]
    fn test_undeliverable_invite_releases_pairing() {
        let mut relay = SignalingRelay::new();
        let mut doc = connect_with_buffer(&mut relay, "doc1", 1);
        // pat1 coming online fills doc1's only slot with a presence frame.
        let mut pat = connect(&mut relay, "pat1");

        let outcome = relay.route(pat.connection_id, invite(&pat, &doc));

        assert_eq!(outcome, RouteOutcome::Unreachable);
        assert!(relay.pairings().is_empty());
        assert_eq!(
            pat.drain(),
            vec![ServerFrame::UserUnreachable {
                user_id: uid("doc1")
            }]
        );

        // Neither side is stuck busy once doc1 drains.
        doc.drain();
        let nurse = connect(&mut relay, "nurse1");
        doc.drain();
        assert_eq!(
            relay.route(pat.connection_id, invite(&pat, &doc)),
            RouteOutcome::Forwarded { to: uid("doc1") }
        );
        assert_eq!(
            relay.route(nurse.connection_id, invite(&nurse, &pat)),
            RouteOutcome::Busy
        );
    }

    #[test]
    fn test_reject_unpairs_and_forwards() {
        let mut relay = SignalingRelay::new();
        let mut pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");
        relay.route(pat.connection_id, invite(&pat, &doc));
        doc.drain();

        let reject = SignalingMessage::Reject {
            from: doc.user.clone(),
            to: pat.user.clone(),
        };
        let outcome = relay.route(doc.connection_id, reject.clone());

        assert_eq!(outcome, RouteOutcome::Forwarded { to: uid("pat1") });
        assert!(relay.pairings().is_empty());
        assert_eq!(pat.signals(), vec![reject]);

        // Both are free for a new call.
        assert_eq!(
            relay.route(pat.connection_id, invite(&pat, &doc)),
            RouteOutcome::Forwarded { to: uid("doc1") }
        );
    }

    #[test]
    fn test_disconnect_ends_call_and_broadcasts_offline() {
        let mut relay = SignalingRelay::new();
        let pat = connect(&mut relay, "pat1");
        let mut doc = connect(&mut relay, "doc1");
        let mut watcher = connect(&mut relay, "nurse1");
        relay.route(pat.connection_id, invite(&pat, &doc));
        doc.drain();
        watcher.drain();

        let departure = relay.disconnect(&pat.user, pat.connection_id);

        assert!(departure.was_live);
        assert_eq!(departure.notified_partner, Some(uid("doc1")));
        assert!(relay.pairings().is_empty());
        assert!(relay.presence().lookup(&pat.user).is_none());
        assert_eq!(
            doc.drain(),
            vec![
                ServerFrame::Signal(SignalingMessage::End {
                    from: uid("pat1"),
                    to: uid("doc1")
                }),
                ServerFrame::PresenceChanged {
                    user_id: uid("pat1"),
                    online: false
                },
            ]
        );
        assert_eq!(
            watcher.drain(),
            vec![ServerFrame::PresenceChanged {
                user_id: uid("pat1"),
                online: false
            }]
        );
    }

    #[test]
    fn test_superseded_connection_close_keeps_call() {
        let mut relay = SignalingRelay::new();
        let old = connect(&mut relay, "pat1");
        let doc = connect(&mut relay, "doc1");
        relay.route(old.connection_id, invite(&old, &doc));

        let (tx, _rx) = mpsc::channel(8);
        let registration = relay.register(
            &uid("pat1"),
            ChannelHandle::new(Uuid::new_v4(), tx, CancellationToken::new()),
        );
        let superseded = registration.superseded.expect("old connection superseded");
        assert_eq!(superseded.connection_id(), old.connection_id);

        let departure = relay.disconnect(&old.user, old.connection_id);

        assert_eq!(departure, Departure::default());
        assert!(relay.presence().lookup(&uid("pat1")).is_some());
        assert_eq!(relay.pairings().partner_of(&doc.user), Some(&uid("pat1")));
    }

    #[test]
    fn test_drop_reason_labels() {
        assert_eq!(DropReason::from(DeliveryError::ChannelFull).as_str(), "channel_full");
        assert_eq!(DropReason::from(DeliveryError::ChannelClosed).as_str(), "channel_closed");
        assert_eq!(DropReason::StalePeer.as_str(), "stale_peer");
    }
}
