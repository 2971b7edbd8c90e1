//! In-memory media devices and negotiation engine for tests.
//!
//! Enabled with the `test-utils` feature. The mock engine answers
//! immediately and, in auto-connect mode, reports `Connected` as soon as
//! both descriptions are applied, so two controllers wired through a real
//! relay complete a call without any network media.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use signaling_protocol::NegotiationBlob;
use tokio::sync::{mpsc, Semaphore};

use crate::errors::{MediaError, NegotiationError};
use crate::media::{LocalMedia, MediaDevices, MediaStream};
use crate::negotiation::{
    NegotiationEngine, NegotiationEngineFactory, NegotiationEvent, NegotiationSession,
    RemoteMedia,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Media stream that records toggles and stops.
#[derive(Debug)]
pub struct MockMediaStream {
    id: String,
    audio: AtomicBool,
    video: AtomicBool,
    stops: AtomicUsize,
}

impl MockMediaStream {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaStream for MockMediaStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Media devices that hand out [`MockMediaStream`]s.
#[derive(Debug, Default)]
pub struct MockMediaDevices {
    failure: Mutex<Option<MediaError>>,
    gate: Option<Arc<Semaphore>>,
    requests: AtomicUsize,
    streams: Mutex<Vec<Arc<MockMediaStream>>>,
}

impl MockMediaDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition fails with `error`.
    #[must_use]
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    /// Each acquisition waits for one permit on the returned semaphore,
    /// standing in for a pending permission prompt.
    #[must_use]
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let devices = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (devices, gate)
    }

    pub fn set_failure(&self, error: Option<MediaError>) {
        *lock(&self.failure) = error;
    }

    /// Streams handed out so far.
    #[must_use]
    pub fn streams(&self) -> Vec<Arc<MockMediaStream>> {
        lock(&self.streams).clone()
    }

    /// Acquisitions started, including ones still waiting on the gate.
    #[must_use]
    pub fn requested_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn acquired_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Streams acquired and not yet stopped.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.streams)
            .iter()
            .filter(|s| s.stop_count() == 0)
            .count()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(&self) -> Result<Arc<dyn MediaStream>, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        let mut streams = lock(&self.streams);
        let stream = Arc::new(MockMediaStream::new(format!("local-{}", streams.len() + 1)));
        streams.push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// A call made on a [`MockNegotiationEngine`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateOffer,
    ApplyRemoteOffer(NegotiationBlob),
    ApplyRemoteAnswer(NegotiationBlob),
    AddRemoteCandidate(NegotiationBlob),
}

/// Negotiation engine that fabricates descriptions and candidates.
#[derive(Debug)]
pub struct MockNegotiationEngine {
    label: String,
    events: mpsc::Sender<NegotiationEvent>,
    auto_connect: bool,
    fail: bool,
    calls: Mutex<Vec<EngineCall>>,
    closes: AtomicUsize,
}

impl MockNegotiationEngine {
    /// Push an event as if the peer connection produced it.
    pub async fn emit(&self, event: NegotiationEvent) {
        let _ = self.events.send(event).await;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    /// Remote candidates applied, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<NegotiationBlob> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                EngineCall::AddRemoteCandidate(blob) => Some(blob.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, call: EngineCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self) -> Result<(), NegotiationError> {
        if self.fail {
            return Err(NegotiationError::Failed("mock failure".to_string()));
        }
        if self.close_count() > 0 {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    async fn connect(&self) {
        if self.auto_connect {
            self.emit(NegotiationEvent::RemoteMedia(RemoteMedia {
                stream_id: format!("remote-{}", self.label),
            }))
            .await;
            self.emit(NegotiationEvent::Connected).await;
        }
    }
}

#[async_trait]
impl NegotiationEngine for MockNegotiationEngine {
    async fn create_offer(&self) -> Result<NegotiationBlob, NegotiationError> {
        self.record(EngineCall::CreateOffer);
        self.check()?;
        self.emit(NegotiationEvent::LocalCandidate(NegotiationBlob::from_value(&json!({
            "candidate": format!("candidate:1 1 udp 1 10.0.0.1 5000 typ host {}", self.label),
        }))?))
        .await;
        Ok(NegotiationBlob::from_value(
            &json!({"type": "offer", "sdp": format!("offer-{}", self.label)}),
        )?)
    }

    async fn apply_remote_offer(
        &self,
        offer: NegotiationBlob,
    ) -> Result<NegotiationBlob, NegotiationError> {
        self.record(EngineCall::ApplyRemoteOffer(offer));
        self.check()?;
        self.emit(NegotiationEvent::LocalCandidate(NegotiationBlob::from_value(&json!({
            "candidate": format!("candidate:1 1 udp 1 10.0.0.2 5000 typ host {}", self.label),
        }))?))
        .await;
        self.connect().await;
        Ok(NegotiationBlob::from_value(
            &json!({"type": "answer", "sdp": format!("answer-{}", self.label)}),
        )?)
    }

    async fn apply_remote_answer(&self, answer: NegotiationBlob) -> Result<(), NegotiationError> {
        self.record(EngineCall::ApplyRemoteAnswer(answer));
        self.check()?;
        self.connect().await;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: NegotiationBlob,
    ) -> Result<(), NegotiationError> {
        self.record(EngineCall::AddRemoteCandidate(candidate));
        self.check()
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`MockNegotiationEngine`]s and keeping them for inspection.
#[derive(Debug)]
pub struct MockNegotiationFactory {
    auto_connect: bool,
    fail: bool,
    engines: Mutex<Vec<Arc<MockNegotiationEngine>>>,
    ice_servers: Mutex<Vec<String>>,
}

impl Default for MockNegotiationFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNegotiationFactory {
    /// Engines connect once both descriptions are applied.
    #[must_use]
    pub fn new() -> Self {
        Self {
            auto_connect: true,
            fail: false,
            engines: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(Vec::new()),
        }
    }

    /// Engines never connect on their own; drive them with
    /// [`MockNegotiationEngine::emit`].
    #[must_use]
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Every engine operation fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    #[must_use]
    pub fn engines(&self) -> Vec<Arc<MockNegotiationEngine>> {
        lock(&self.engines).clone()
    }

    #[must_use]
    pub fn last_engine(&self) -> Option<Arc<MockNegotiationEngine>> {
        lock(&self.engines).last().cloned()
    }

    /// ICE servers the last engine was created with.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<String> {
        lock(&self.ice_servers).clone()
    }
}

impl NegotiationEngineFactory for MockNegotiationFactory {
    fn create(
        &self,
        ice_servers: &[String],
        local_media: &LocalMedia,
    ) -> Result<NegotiationSession, NegotiationError> {
        let (events, receiver) = mpsc::channel(64);
        let engine = Arc::new(MockNegotiationEngine {
            label: local_media.id().to_string(),
            events,
            auto_connect: self.auto_connect,
            fail: self.fail,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });

        *lock(&self.ice_servers) = ice_servers.to_vec();
        lock(&self.engines).push(Arc::clone(&engine));

        Ok(NegotiationSession {
            engine,
            events: receiver,
        })
    }
}
