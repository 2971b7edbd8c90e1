//! Client-side call session.
//!
//! A [`SessionController`] owns at most one call at a time and drives it
//! through `Idle -> Calling/Ringing -> Connecting -> Connected -> Ended`,
//! exchanging signaling with the peer through the relay and steering a
//! per-call [`NegotiationEngine`].
//!
//! # Architecture
//!
//! ```text
//! UI ──SessionHandle──▶ SessionController ◀──frames── RelayConnection ◀── relay
//!  ▲                        │   │                          ▲
//!  └──── CallEvent ─────────┘   └── ClientFrame (mpsc) ────┘
//!                               │
//!                     MediaDevices / NegotiationEngine
//! ```
//!
//! - [`controller`] - the actor and its handle
//! - [`state`] - call states, snapshots, events
//! - [`media`] / [`negotiation`] - platform contracts
//! - [`client`] - WebSocket connection to the relay
//! - [`rtc`] - negotiation engine on a `webrtc` peer connection
//! - `testing` - mock media and engine (feature `test-utils`)

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod controller;
pub mod errors;
pub mod media;
pub mod messages;
pub mod negotiation;
pub mod rtc;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::RelayConnection;
pub use config::SessionConfig;
pub use controller::{SessionController, SessionHandle};
pub use errors::{CallError, MediaError, NegotiationError};
pub use media::{LocalMedia, MediaDevices, MediaStream};
pub use negotiation::{
    NegotiationEngine, NegotiationEngineFactory, NegotiationEvent, NegotiationSession,
    RemoteMedia,
};
pub use rtc::{WebRtcEngine, WebRtcEngineFactory};
pub use state::{CallEvent, CallRole, CallSnapshot, CallState, EndReason};
