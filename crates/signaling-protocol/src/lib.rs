//! Call-session signaling protocol.
//!
//! This crate defines the JSON text frames exchanged between browser clients
//! and the signaling relay over a WebSocket channel:
//!
//! - [`types`] - user identifiers and caller profile summaries
//! - [`message`] - the [`SignalingMessage`] sum type and the client/server frames
//! - [`codec`] - size-checked JSON encoding and decoding
//!
//! Frames are adjacently tagged (`{"event": ..., "data": ...}`); signaling
//! messages inside them are internally tagged by `type`.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;
pub mod types;

pub use codec::ProtocolError;
pub use message::{ClientFrame, MessageKind, NegotiationBlob, ServerFrame, SignalingMessage};
pub use types::{CallerProfile, UserId, UserRole};
