//! JSON codec for signaling frames.
//!
//! Every frame is a single WebSocket text message. Decoding enforces a
//! maximum frame size before parsing so an oversized frame is rejected
//! without allocating its parse tree.

use crate::message::{ClientFrame, ServerFrame};

/// Default maximum frame size accepted by the decoder (64 KiB).
///
/// Session descriptions are the largest legitimate payloads and stay well
/// below this.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured size limit
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame is not valid JSON or does not match any known frame
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// User identifier failed validation
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    /// Frame could not be serialized
    #[error("Encoding failed: {0}")]
    Encode(String),
}

fn check_len(text: &str, max: usize) -> Result<(), ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            len: text.len(),
            max,
        });
    }
    Ok(())
}

/// Decode a frame received from a client.
///
/// # Errors
///
/// Returns an error if the frame is larger than `max_len` or malformed.
pub fn decode_client_frame(text: &str, max_len: usize) -> Result<ClientFrame, ProtocolError> {
    check_len(text, max_len)?;
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a frame received from the relay.
///
/// # Errors
///
/// Returns an error if the frame is larger than `max_len` or malformed.
pub fn decode_server_frame(text: &str, max_len: usize) -> Result<ServerFrame, ProtocolError> {
    check_len(text, max_len)?;
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encode a frame for sending to the relay.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encode a frame for sending to a client.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Encode(e.to_string()))
}
