//! Connection and call bookkeeping owned by the relay actor.
//!
//! Both tables are plain synchronous maps. They are never shared: the
//! [`RelayActor`](crate::actors::RelayActor) owns them and serializes every
//! read and write through its mailbox.

pub mod pairing;
pub mod presence;

pub use pairing::PairingTable;
pub use presence::{ChannelHandle, PresenceRegistry};
