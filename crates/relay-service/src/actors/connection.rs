//! `ConnectionActor` - one per client WebSocket.
//!
//! Each connection runs two tasks:
//! - the reader (this actor) decodes inbound frames and forwards them, in
//!   order, to the relay actor
//! - the writer drains the connection's bounded outbound buffer onto the
//!   socket
//!
//! The connection is bound to a user by its first `online` frame. Signaling
//! messages are only forwarded when their `from` matches that user. Frames
//! that fail to decode are logged and dropped; they never close the
//! connection.
//!
//! # Lifecycle
//!
//! 1. Created on WebSocket upgrade
//! 2. Runs until the client closes, the connection is superseded by a newer
//!    one for the same user, or the relay shuts down
//! 3. On exit, reports the disconnect to the relay actor

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_client_frame, encode_server_frame};
use signaling_protocol::message::OnlinePayload;
use signaling_protocol::{ClientFrame, ServerFrame, SignalingMessage, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::metrics::ActorMetrics;
use super::relay::RelayActorHandle;
use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::registry::ChannelHandle;

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Outbound frames buffered before further frames are dropped.
    pub channel_buffer: usize,
    /// Largest inbound text frame accepted.
    pub max_frame_bytes: usize,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: Uuid,
    /// Bound by the first `online` frame.
    user_id: Option<UserId>,
    relay: RelayActorHandle,
    /// Child of the relay's token; also fired when superseded.
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    config: ConnectionConfig,
    outbound: mpsc::Sender<ServerFrame>,
    frames_received: u64,
}

impl ConnectionActor {
    /// Serve one upgraded WebSocket until it closes.
    pub async fn serve(
        socket: WebSocket,
        relay: RelayActorHandle,
        config: ConnectionConfig,
        metrics: Arc<ActorMetrics>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(config.channel_buffer);
        let actor = Self {
            connection_id: Uuid::new_v4(),
            user_id: None,
            cancel_token: relay.child_token(),
            relay,
            metrics,
            config,
            outbound,
            frames_received: 0,
        };

        let (sink, stream) = socket.split();
        actor.run(sink, stream, outbound_rx).await;
    }

    #[instrument(skip_all, name = "relay.connection", fields(connection_id = %self.connection_id))]
    async fn run(
        mut self,
        sink: SplitSink<WebSocket, Message>,
        mut stream: SplitStream<WebSocket>,
        outbound_rx: mpsc::Receiver<ServerFrame>,
    ) {
        prom::set_connections_active(self.metrics.connection_opened());
        debug!(
            target: "relay.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let writer = tokio::spawn(write_frames(
            sink,
            outbound_rx,
            self.cancel_token.clone(),
            self.connection_id,
        ));

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.frames_received += 1;
                            if let Err(e) = self.handle_text(&text).await {
                                warn!(
                                    target: "relay.connection",
                                    connection_id = %self.connection_id,
                                    error = %e,
                                    "Relay unavailable, closing connection"
                                );
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!(
                                target: "relay.connection",
                                connection_id = %self.connection_id,
                                len = data.len(),
                                "Dropping binary frame"
                            );
                            self.record_drop("binary");
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(
                                target: "relay.connection",
                                connection_id = %self.connection_id,
                                "Client closed connection"
                            );
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(
                                target: "relay.connection",
                                connection_id = %self.connection_id,
                                error = %e,
                                "WebSocket read failed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Stops the writer.
        self.cancel_token.cancel();

        if let Some(user_id) = self.user_id.take() {
            if let Err(e) = self.relay.disconnect(user_id, self.connection_id).await {
                debug!(
                    target: "relay.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Disconnect not reported, relay already stopped"
                );
            }
        }

        let _ = writer.await;
        prom::set_connections_active(self.metrics.connection_closed());

        info!(
            target: "relay.connection",
            connection_id = %self.connection_id,
            frames_received = self.frames_received,
            "ConnectionActor stopped"
        );
    }

    /// Handle one text frame. Errors only when the relay actor is gone.
    async fn handle_text(&mut self, text: &str) -> Result<(), RelayError> {
        let frame = match decode_client_frame(text, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                let err = RelayError::from(e);
                debug!(
                    target: "relay.connection",
                    connection_id = %self.connection_id,
                    len = text.len(),
                    error = %err,
                    "Dropping undecodable frame"
                );
                self.record_drop(err.reason_label());
                return Ok(());
            }
        };

        match frame {
            ClientFrame::Online(OnlinePayload { user_id }) => self.handle_online(user_id).await,
            ClientFrame::Signal(message) => self.handle_signal(message).await,
        }
    }

    async fn handle_online(&mut self, user_id: UserId) -> Result<(), RelayError> {
        if let Some(current) = &self.user_id {
            if current != &user_id {
                warn!(
                    target: "relay.connection",
                    connection_id = %self.connection_id,
                    bound_user = %current,
                    requested_user = %user_id,
                    "Ignoring online frame for a different user"
                );
                self.record_drop("rebind");
                return Ok(());
            }
        }

        self.user_id = Some(user_id.clone());
        let handle = ChannelHandle::new(
            self.connection_id,
            self.outbound.clone(),
            self.cancel_token.clone(),
        );
        self.relay.register(user_id, handle).await
    }

    async fn handle_signal(&mut self, message: SignalingMessage) -> Result<(), RelayError> {
        let Some(user_id) = &self.user_id else {
            debug!(
                target: "relay.connection",
                connection_id = %self.connection_id,
                kind = message.kind().as_str(),
                "Dropping signal from unregistered connection"
            );
            self.record_drop("unregistered");
            return Ok(());
        };

        if message.from() != user_id {
            warn!(
                target: "relay.connection",
                connection_id = %self.connection_id,
                user_id = %user_id,
                claimed_from = %message.from(),
                "Dropping signal with mismatched sender"
            );
            self.record_drop("unauthenticated");
            return Ok(());
        }

        self.relay.route(self.connection_id, message).await
    }

    fn record_drop(&self, reason: &'static str) {
        self.metrics.record_dropped();
        prom::record_message_dropped(reason);
    }
}

/// Writer task: drain the outbound buffer onto the socket.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
    cancel_token: CancellationToken,
    connection_id: Uuid,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            frame = frames.recv() => {
                let Some(frame) = frame else { break };

                let text = match encode_server_frame(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            target: "relay.connection",
                            connection_id = %connection_id,
                            error = %e,
                            "Failed to encode outbound frame"
                        );
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(
                        target: "relay.connection",
                        connection_id = %connection_id,
                        error = %e,
                        "WebSocket write failed"
                    );
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}
