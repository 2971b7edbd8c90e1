//! Local media contract.
//!
//! Capture devices are platform-specific; the controller only sees
//! [`MediaDevices`] and the [`MediaStream`] it yields. A stream is owned by
//! exactly one [`LocalMedia`], and releasing consumes it, so a call can never
//! stop its tracks twice.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::MediaError;

/// A captured audio+video stream.
pub trait MediaStream: Send + Sync + fmt::Debug {
    /// Stable identifier rendered into snapshots.
    fn id(&self) -> &str;

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);

    /// Stop all tracks and free the devices.
    fn stop(&self);
}

/// Source of local media.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and microphone. May suspend on a permission prompt.
    async fn acquire(&self) -> Result<Arc<dyn MediaStream>, MediaError>;
}

/// Local media owned by one call attempt.
#[derive(Debug)]
pub struct LocalMedia {
    stream: Arc<dyn MediaStream>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(stream: Arc<dyn MediaStream>) -> Self {
        Self { stream }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.stream.id()
    }

    /// Shared view of the stream for attaching to a negotiation engine.
    #[must_use]
    pub fn stream(&self) -> Arc<dyn MediaStream> {
        Arc::clone(&self.stream)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.stream.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.stream.set_video_enabled(enabled);
    }

    /// Stop the stream. Consumes the owner.
    pub fn release(self) {
        tracing::debug!(
            target: "call.session.media",
            stream_id = %self.stream.id(),
            "Releasing local media"
        );
        self.stream.stop();
    }
}
