//! # Call Test Utilities
//!
//! Shared test utilities for end-to-end call tests.
//!
//! This crate provides:
//! - Relay harness (`TestRelayServer`, a real relay on an ephemeral port)
//! - Client harness (`TestClient`, a session controller with mock media
//!   connected to the relay over WebSocket)
//! - Raw protocol client (`RawClient`) for driving the relay frame by frame
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestRelayServer::spawn().await?;
//!     let mut pat = TestClient::connect(&server, "pat1").await?;
//!     let mut doc = TestClient::connect(&server, "doc1").await?;
//!
//!     pat.handle().initiate(uid("doc1")).await?;
//!     doc.wait_state(CallState::Ringing).await;
//!     Ok(())
//! }
//! ```

pub mod client_harness;
pub mod raw_client;
pub mod server_harness;

pub use client_harness::TestClient;
pub use raw_client::RawClient;
pub use server_harness::TestRelayServer;

use signaling_protocol::UserId;

/// Parse a user id, panicking on invalid test input.
pub fn uid(value: &str) -> UserId {
    UserId::parse(value).expect("valid test user id")
}
