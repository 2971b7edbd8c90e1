//! `RelayActor` - the single task that owns presence and pairing state.
//!
//! Every connection funnels `register`, `disconnect` and `route` requests
//! through this actor's mailbox. Processing them one at a time serializes
//! all conflicting updates (two racing invites to the same user cannot both
//! pair) and preserves per-connection FIFO order, since each connection
//! awaits its own sends in order.
//!
//! # Lifecycle
//!
//! 1. Spawned once at startup
//! 2. Runs until its cancellation token fires or every handle is dropped
//! 3. On cancellation, closes the mailbox and drains what was already queued

use std::sync::Arc;
use std::time::Instant;

use signaling_protocol::{SignalingMessage, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::messages::{RelayMessage, RelayStatus, UserPresence};
use super::metrics::{ActorMetrics, MailboxMonitor};
use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::registry::ChannelHandle;
use crate::routing::{RouteOutcome, SignalingRelay};

/// Handle to the `RelayActor`.
#[derive(Clone, Debug)]
pub struct RelayActorHandle {
    sender: mpsc::Sender<RelayMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RelayActorHandle {
    async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(message)
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Bind `user_id` to the connection behind `handle`.
    pub async fn register(&self, user_id: UserId, handle: ChannelHandle) -> Result<(), RelayError> {
        self.send(RelayMessage::Register { user_id, handle }).await
    }

    /// Report that a connection bound to `user_id` has closed.
    pub async fn disconnect(&self, user_id: UserId, connection_id: Uuid) -> Result<(), RelayError> {
        self.send(RelayMessage::Disconnect {
            user_id,
            connection_id,
        })
        .await
    }

    /// Route a signaling message received on `connection_id`.
    pub async fn route(
        &self,
        connection_id: Uuid,
        message: SignalingMessage,
    ) -> Result<(), RelayError> {
        self.send(RelayMessage::Route {
            connection_id,
            message,
        })
        .await
    }

    /// Look up a user's live connection and partner.
    pub async fn inspect(&self, user_id: UserId) -> Result<UserPresence, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayMessage::Inspect {
            user_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Aggregate relay status.
    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(RelayMessage::GetStatus { respond_to: tx }).await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for connection actors and servers.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `RelayActor` implementation.
pub struct RelayActor {
    instance_id: String,
    relay: SignalingRelay,
    receiver: mpsc::Receiver<RelayMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RelayActor {
    /// Spawn the relay actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        instance_id: String,
        mailbox_buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RelayActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_buffer);
        let mailbox = Arc::new(MailboxMonitor::new(&instance_id));

        let actor = Self {
            instance_id,
            relay: SignalingRelay::new(),
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RelayActorHandle {
            sender,
            cancel_token,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "relay.actor", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor",
            instance_id = %self.instance_id,
            "RelayActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor",
                        instance_id = %self.instance_id,
                        "RelayActor received cancellation signal, draining mailbox"
                    );
                    self.receiver.close();
                    while let Some(message) = self.receiver.recv().await {
                        self.process(message);
                    }
                    break;
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.process(message);
                    } else {
                        debug!(
                            target: "relay.actor",
                            instance_id = %self.instance_id,
                            "RelayActor channel closed, exiting"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            target: "relay.actor",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_routed = self.metrics.messages_routed(),
            messages_dropped = self.metrics.messages_dropped(),
            "RelayActor stopped"
        );
    }

    fn process(&mut self, message: RelayMessage) {
        self.mailbox.record_dequeue();
        self.handle_message(message);
        prom::set_mailbox_depth(self.mailbox.current_depth());
    }

    fn handle_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Register { user_id, handle } => {
                self.handle_register(&user_id, handle);
            }

            RelayMessage::Disconnect {
                user_id,
                connection_id,
            } => {
                self.handle_disconnect(&user_id, connection_id);
            }

            RelayMessage::Route {
                connection_id,
                message,
            } => {
                self.handle_route(connection_id, message);
            }

            RelayMessage::Inspect {
                user_id,
                respond_to,
            } => {
                let handle = self.relay.presence().lookup(&user_id);
                let presence = UserPresence {
                    connection_id: handle.map(ChannelHandle::connection_id),
                    connected_at: handle.map(ChannelHandle::connected_at),
                    partner: self.relay.pairings().partner_of(&user_id).cloned(),
                };
                let _ = respond_to.send(presence);
            }

            RelayMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RelayStatus {
                    status: "ok",
                    instance_id: self.instance_id.clone(),
                    online_users: self.relay.presence().len(),
                    active_pairings: self.relay.pairings().len(),
                    active_connections: self.metrics.connection_count(),
                    messages_processed: self.mailbox.messages_processed(),
                });
            }
        }
    }

    fn handle_register(&mut self, user_id: &UserId, handle: ChannelHandle) {
        let connection_id = handle.connection_id();
        let registration = self.relay.register(user_id, handle);

        if let Some(previous) = registration.superseded {
            info!(
                target: "relay.actor",
                user_id = %user_id,
                connection_id = %connection_id,
                superseded_connection_id = %previous.connection_id(),
                "Newer connection superseded existing registration"
            );
            previous.close();
        } else {
            debug!(
                target: "relay.actor",
                user_id = %user_id,
                connection_id = %connection_id,
                "User registered"
            );
        }

        self.update_gauges();
    }

    fn handle_disconnect(&mut self, user_id: &UserId, connection_id: Uuid) {
        let departure = self.relay.disconnect(user_id, connection_id);

        if departure.was_live {
            debug!(
                target: "relay.actor",
                user_id = %user_id,
                connection_id = %connection_id,
                partner_notified = departure.notified_partner.is_some(),
                "User unregistered"
            );
        } else {
            debug!(
                target: "relay.actor",
                user_id = %user_id,
                connection_id = %connection_id,
                "Superseded connection closed"
            );
        }

        self.update_gauges();
    }

    fn handle_route(&mut self, connection_id: Uuid, message: SignalingMessage) {
        let started = Instant::now();
        let kind = message.kind().as_str();
        let from = message.from().clone();
        let to = message.to().clone();

        let outcome = self.relay.route(connection_id, message);

        match &outcome {
            RouteOutcome::Forwarded { .. } => {
                self.metrics.record_routed();
                prom::record_message_routed(kind);
            }
            RouteOutcome::Unreachable => prom::record_invite_reply("unreachable"),
            RouteOutcome::Busy => prom::record_invite_reply("busy"),
            RouteOutcome::Dropped(reason) => {
                self.metrics.record_dropped();
                prom::record_message_dropped(reason.as_str());
            }
        }
        prom::record_route_latency(kind, started.elapsed());

        debug!(
            target: "relay.actor",
            kind = kind,
            from = %from,
            to = %to,
            outcome = ?outcome,
            "Routed signaling message"
        );

        self.update_gauges();
    }

    fn update_gauges(&self) {
        prom::set_online_users(self.relay.presence().len());
        prom::set_pairings_active(self.relay.pairings().len());
    }
}
