//! Negotiation engine contract.
//!
//! One engine per call. The engine owns the peer connection; the controller
//! feeds it remote descriptions and candidates and consumes its
//! [`NegotiationEvent`] stream. Payloads are [`NegotiationBlob`]s and are
//! never inspected by the controller.

use async_trait::async_trait;
use signaling_protocol::NegotiationBlob;
use tokio::sync::mpsc;

use crate::errors::NegotiationError;
use crate::media::LocalMedia;

/// Handle to the remote party's media, as rendered by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
}

/// Events emitted by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// A local connectivity candidate to send to the peer.
    LocalCandidate(NegotiationBlob),
    /// The peer's media became available.
    RemoteMedia(RemoteMedia),
    Connected,
    Failed(String),
    Disconnected,
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Produce the initiator's offer.
    async fn create_offer(&self) -> Result<NegotiationBlob, NegotiationError>;

    /// Apply the initiator's offer and produce the answer.
    async fn apply_remote_offer(
        &self,
        offer: NegotiationBlob,
    ) -> Result<NegotiationBlob, NegotiationError>;

    async fn apply_remote_answer(&self, answer: NegotiationBlob) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(
        &self,
        candidate: NegotiationBlob,
    ) -> Result<(), NegotiationError>;

    /// Tear down the peer connection. Called exactly once per call.
    fn close(&self);
}

/// A freshly created engine and its event stream.
pub struct NegotiationSession {
    pub engine: std::sync::Arc<dyn NegotiationEngine>,
    pub events: mpsc::Receiver<NegotiationEvent>,
}

/// Creates one engine per call with the local media attached.
pub trait NegotiationEngineFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the peer connection cannot be set up.
    fn create(
        &self,
        ice_servers: &[String],
        local_media: &LocalMedia,
    ) -> Result<NegotiationSession, NegotiationError>;
}
