//! Observability for the relay service.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_connections_active` | Gauge | none | Open WebSocket connections |
//! | `relay_online_users` | Gauge | none | Users with a registered channel |
//! | `relay_pairings_active` | Gauge | none | Calls in progress (ringing or live) |
//! | `relay_mailbox_depth` | Gauge | none | Relay actor backlog |
//! | `relay_messages_routed_total` | Counter | `kind` | Forwarded signaling messages |
//! | `relay_messages_dropped_total` | Counter | `reason` | Discarded frames and messages |
//! | `relay_invite_replies_total` | Counter | `outcome` | Unreachable/busy replies |
//! | `relay_route_latency_seconds` | Histogram | `kind` | Routing time inside the relay actor |
//!
//! Negotiation payloads and caller profiles are never logged; only message
//! kinds and payload sizes are.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
