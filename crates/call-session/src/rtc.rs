//! Negotiation engine backed by a `webrtc` peer connection.
//!
//! [`WebRtcEngineFactory`] builds one [`WebRtcEngine`] per call. The engine
//! owns an `RTCPeerConnection` configured with the session's ICE servers and
//! carrying one Opus and one VP8 local track tagged with the call's local
//! stream id. Capture pipelines write samples into those tracks through
//! [`WebRtcEngine::local_tracks`].
//!
//! Blobs on the wire use the browser shapes: session descriptions are
//! `{"type": ..., "sdp": ...}` and candidates are `RTCIceCandidateInit`.
//! Local candidates trickle out as [`NegotiationEvent::LocalCandidate`].
//!
//! The peer connection is created on first use because construction is
//! asynchronous and the factory is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use signaling_protocol::NegotiationBlob;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::errors::NegotiationError;
use crate::media::LocalMedia;
use crate::negotiation::{
    NegotiationEngine, NegotiationEngineFactory, NegotiationEvent, NegotiationSession,
    RemoteMedia,
};

/// Capacity of each engine's event channel.
pub const EVENT_BUFFER: usize = 64;

fn failed(context: &str, err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Failed(format!("{context}: {err}"))
}

/// One ICE server entry per configured URL.
#[must_use]
pub fn rtc_configuration(ice_servers: &[String]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| failed("codec registration", e))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| failed("interceptor registration", e))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Local audio and video tracks sent to the peer.
#[derive(Clone)]
pub struct LocalTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

impl LocalTracks {
    fn new(stream_id: &str) -> Self {
        let track = |mime_type: &str, kind: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    ..Default::default()
                },
                kind.to_string(),
                stream_id.to_string(),
            ))
        };

        Self {
            audio: track(MIME_TYPE_OPUS, "audio"),
            video: track(MIME_TYPE_VP8, "video"),
        }
    }
}

/// Creates [`WebRtcEngine`]s.
#[derive(Debug, Default)]
pub struct WebRtcEngineFactory;

impl WebRtcEngineFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl NegotiationEngineFactory for WebRtcEngineFactory {
    fn create(
        &self,
        ice_servers: &[String],
        local_media: &LocalMedia,
    ) -> Result<NegotiationSession, NegotiationError> {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let engine = WebRtcEngine {
            api: build_api()?,
            configuration: rtc_configuration(ice_servers),
            tracks: LocalTracks::new(local_media.id()),
            events,
            peer: OnceCell::new(),
            closed: AtomicBool::new(false),
        };

        debug!(
            target: "call.session.rtc",
            stream_id = %local_media.id(),
            ice_servers = ice_servers.len(),
            "WebRTC engine created"
        );

        Ok(NegotiationSession {
            engine: Arc::new(engine),
            events: receiver,
        })
    }
}

/// A call's peer connection.
pub struct WebRtcEngine {
    api: API,
    configuration: RTCConfiguration,
    tracks: LocalTracks,
    events: mpsc::Sender<NegotiationEvent>,
    peer: OnceCell<Arc<RTCPeerConnection>>,
    closed: AtomicBool,
}

impl WebRtcEngine {
    /// Tracks to feed captured samples into.
    #[must_use]
    pub fn local_tracks(&self) -> &LocalTracks {
        &self.tracks
    }

    async fn peer(&self) -> Result<&Arc<RTCPeerConnection>, NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        self.peer.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(|e| failed("peer connection", e))?,
        );

        for track in [&self.tracks.audio, &self.tracks.video] {
            let track: Arc<dyn TrackLocal + Send + Sync> = Arc::<TrackLocalStaticSample>::clone(track);
            peer.add_track(track)
                .await
                .map_err(|e| failed("add track", e))?;
        }

        self.attach_handlers(&peer);
        Ok(peer)
    }

    fn attach_handlers(&self, peer: &RTCPeerConnection) {
        let events = self.events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering; nothing to send.
                let Some(candidate) = candidate else {
                    return;
                };
                let blob = candidate
                    .to_json()
                    .map_err(|e| failed("candidate", e))
                    .and_then(|init| NegotiationBlob::from_value(&init).map_err(Into::into));
                match blob {
                    Ok(blob) => {
                        let _ = events.send(NegotiationEvent::LocalCandidate(blob)).await;
                    }
                    Err(e) => {
                        warn!(target: "call.session.rtc", error = %e, "Local candidate dropped");
                    }
                }
            })
        }));

        let events = self.events.clone();
        let remote_seen = AtomicBool::new(false);
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                // Audio and video arrive as separate tracks of one stream.
                let first = !remote_seen.swap(true, Ordering::SeqCst);
                Box::pin(async move {
                    if first {
                        let media = RemoteMedia {
                            stream_id: track.stream_id(),
                        };
                        let _ = events.send(NegotiationEvent::RemoteMedia(media)).await;
                    }
                })
            },
        ));

        let events = self.events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                debug!(target: "call.session.rtc", state = %state, "Peer connection state");
                let event = match state {
                    RTCPeerConnectionState::Connected => NegotiationEvent::Connected,
                    RTCPeerConnectionState::Failed => {
                        NegotiationEvent::Failed("peer connection failed".to_string())
                    }
                    RTCPeerConnectionState::Disconnected => NegotiationEvent::Disconnected,
                    _ => return,
                };
                let _ = events.send(event).await;
            })
        }));
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<NegotiationBlob, NegotiationError> {
        let peer = self.peer().await?;
        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| failed("create offer", e))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| failed("set local description", e))?;
        Ok(NegotiationBlob::from_value(&offer)?)
    }

    async fn apply_remote_offer(
        &self,
        offer: NegotiationBlob,
    ) -> Result<NegotiationBlob, NegotiationError> {
        let offer: RTCSessionDescription = offer.parse()?;
        let peer = self.peer().await?;
        peer.set_remote_description(offer)
            .await
            .map_err(|e| failed("set remote description", e))?;

        let answer = peer
            .create_answer(None)
            .await
            .map_err(|e| failed("create answer", e))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(|e| failed("set local description", e))?;
        Ok(NegotiationBlob::from_value(&answer)?)
    }

    async fn apply_remote_answer(&self, answer: NegotiationBlob) -> Result<(), NegotiationError> {
        let answer: RTCSessionDescription = answer.parse()?;
        self.peer()
            .await?
            .set_remote_description(answer)
            .await
            .map_err(|e| failed("set remote description", e))
    }

    async fn add_remote_candidate(
        &self,
        candidate: NegotiationBlob,
    ) -> Result<(), NegotiationError> {
        let candidate: RTCIceCandidateInit = candidate.parse()?;
        self.peer()
            .await?
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| failed("add candidate", e))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(peer) = self.peer.get() {
            let peer = Arc::clone(peer);
            tokio::spawn(async move {
                if let Err(e) = peer.close().await {
                    debug!(target: "call.session.rtc", error = %e, "Peer connection close failed");
                }
            });
        }
    }
}
