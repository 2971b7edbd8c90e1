//! Frame-level relay client for tests that need to bypass the controller.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_server_frame, encode_client_frame, DEFAULT_MAX_FRAME_BYTES};
use signaling_protocol::{ClientFrame, ServerFrame, SignalingMessage, UserId};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::server_harness::TestRelayServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A bare WebSocket connection speaking the relay protocol.
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    /// Connect and announce `user_id`; consumes the `registered` ack.
    pub async fn online(server: &TestRelayServer, user_id: &UserId) -> Result<Self, anyhow::Error> {
        let (ws, _) = connect_async(server.ws_url())
            .await
            .map_err(|e| anyhow::anyhow!("connect failed: {}", e))?;
        let mut client = Self { ws };

        client.send(ClientFrame::online(user_id.clone())).await?;
        match client.recv().await {
            ServerFrame::Registered { user_id: registered } if &registered == user_id => Ok(client),
            other => Err(anyhow::anyhow!("expected registered, got {:?}", other)),
        }
    }

    pub async fn send(&mut self, frame: ClientFrame) -> Result<(), anyhow::Error> {
        let text = encode_client_frame(&frame)?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn signal(&mut self, message: SignalingMessage) -> Result<(), anyhow::Error> {
        self.send(ClientFrame::Signal(message)).await
    }

    /// Next frame from the relay.
    pub async fn recv(&mut self) -> ServerFrame {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = message {
                return decode_server_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("valid frame");
            }
        }
    }

    /// Next non-presence frame within `window`, if any.
    pub async fn try_recv(&mut self, window: Duration) -> Option<ServerFrame> {
        tokio::time::timeout(window, self.recv_non_presence())
            .await
            .ok()
    }

    /// Next frame that is not a presence update.
    pub async fn recv_non_presence(&mut self) -> ServerFrame {
        loop {
            let frame = self.recv().await;
            if !matches!(frame, ServerFrame::PresenceChanged { .. }) {
                return frame;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
