//! WebSocket connection from a session controller to the relay.
//!
//! The connection announces the local user with an `online` frame and waits
//! for the relay's `registered` acknowledgement before handing the outbound
//! queue to the controller. After that a reader task feeds every decoded
//! frame into the controller's mailbox and a writer task drains the outbound
//! queue, so the controller never touches the socket.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_server_frame, encode_client_frame};
use signaling_protocol::{ClientFrame, ServerFrame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::controller::SessionHandle;
use crate::errors::CallError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the relay to acknowledge `online`.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// A live relay connection bound to one controller.
#[derive(Debug)]
pub struct RelayConnection {
    cancel_token: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect to the relay at `config.relay_url` and register the
    /// controller's user.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Transport`] if the socket cannot be opened or
    /// the relay does not acknowledge registration in time.
    pub async fn connect(config: &SessionConfig, session: SessionHandle) -> Result<Self, CallError> {
        let (mut ws, _) = connect_async(config.relay_url.as_str())
            .await
            .map_err(|e| CallError::Transport(format!("connect failed: {e}")))?;

        let online = encode_client_frame(&ClientFrame::online(session.user_id().clone()))
            .map_err(|e| CallError::Transport(e.to_string()))?;
        ws.send(Message::Text(online))
            .await
            .map_err(|e| CallError::Transport(format!("send failed: {e}")))?;

        tokio::time::timeout(
            REGISTER_TIMEOUT,
            await_registration(&mut ws, &session, config.max_frame_bytes),
        )
        .await
        .map_err(|_| CallError::Transport("registration timed out".to_string()))??;

        info!(
            target: "call.session.client",
            user_id = %session.user_id(),
            url = %config.relay_url,
            "Registered with relay"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
        // Queued ahead of any inbound frame the reader delivers.
        session.channel_opened(outbound_tx.clone()).await?;

        let cancel_token = session.child_token();
        let (sink, stream) = ws.split();

        let writer = tokio::spawn(write_frames(sink, outbound_rx, cancel_token.clone()));
        let reader = tokio::spawn(read_frames(
            stream,
            session,
            outbound_tx,
            config.max_frame_bytes,
            cancel_token.clone(),
        ));

        Ok(Self {
            cancel_token,
            reader,
            writer,
        })
    }

    /// Close the connection. The controller sees the channel close.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.reader.is_finished()
    }

    /// Wait for both connection tasks to finish.
    pub async fn closed(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

async fn await_registration(
    ws: &mut WsStream,
    session: &SessionHandle,
    max_frame_bytes: usize,
) -> Result<(), CallError> {
    while let Some(message) = ws.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(CallError::Transport(format!("receive failed: {e}"))),
        };

        match decode_server_frame(&text, max_frame_bytes) {
            Ok(ServerFrame::Registered { user_id }) if &user_id == session.user_id() => {
                return Ok(());
            }
            Ok(other) => {
                debug!(
                    target: "call.session.client",
                    frame = ?other,
                    "Frame before registration ignored"
                );
            }
            Err(e) => {
                debug!(
                    target: "call.session.client",
                    error = %e,
                    "Undecodable frame before registration"
                );
            }
        }
    }

    Err(CallError::Transport(
        "connection closed before registration".to_string(),
    ))
}

async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ClientFrame>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let text = match encode_client_frame(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "call.session.client", error = %e, "Frame encode failed");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(target: "call.session.client", error = %e, "Relay send failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    cancel_token.cancel();
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    session: SessionHandle,
    outbound: mpsc::Sender<ClientFrame>,
    max_frame_bytes: usize,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            message = stream.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                match decode_server_frame(&text, max_frame_bytes) {
                    Ok(frame) => {
                        if session.deliver(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(
                            target: "call.session.client",
                            error = %e,
                            "Undecodable relay frame dropped"
                        );
                    }
                }
            }
        }
    }

    cancel_token.cancel();
    let _ = session.channel_closed(outbound).await;

    info!(
        target: "call.session.client",
        user_id = %session.user_id(),
        "Relay connection closed"
    );
}
