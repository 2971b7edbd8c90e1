//! Actor model for the relay.
//!
//! - [`RelayActor`] (singleton): owns presence and pairing state, routes
//!   every signaling message
//! - [`ConnectionActor`] (one per WebSocket): decodes client frames, writes
//!   server frames
//!
//! Actors communicate via `tokio::sync::mpsc` channels; request-reply uses
//! `oneshot`. Cancellation flows from the relay's token to every
//! connection through child tokens.

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod relay;

pub use connection::{ConnectionActor, ConnectionConfig};
pub use messages::{RelayMessage, RelayStatus, UserPresence};
pub use metrics::{ActorMetrics, MailboxLevel, MailboxMonitor};
pub use relay::{RelayActor, RelayActorHandle};
