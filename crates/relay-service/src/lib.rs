//! Signaling Relay Service Library
//!
//! The relay lets two clients find each other's live connection and
//! exchange call-control and negotiation messages:
//!
//! - Tracks which user is behind each live WebSocket (presence)
//! - Tracks which users are in a call together (pairing)
//! - Routes invite/accept/reject/end and opaque negotiation payloads
//! - Propagates teardown when either side disconnects
//!
//! It never inspects media or negotiation payloads.
//!
//! # Architecture
//!
//! ```text
//! RelayActor (singleton)
//! ├── owns PresenceRegistry + PairingTable (via SignalingRelay)
//! └── receives register / disconnect / route from
//!     └── ConnectionActor (one per WebSocket)
//!         └── writer task (drains the connection's outbound buffer)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Relay and connection actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types
//! - [`registry`] - Presence registry and pairing table
//! - [`routing`] - Per-kind routing policy
//! - [`routes`] - HTTP routers
//! - [`observability`] - Health probes and Prometheus metrics

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod routing;
pub mod transport;
