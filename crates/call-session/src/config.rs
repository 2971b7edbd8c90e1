//! Call session configuration.

use std::collections::HashMap;
use std::env;

use signaling_protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use thiserror::Error;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/ws";

/// Default ICE servers (public STUN).
pub const DEFAULT_ICE_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Default controller mailbox capacity.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Default event broadcast capacity per subscriber.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default outbound signaling queue on the relay connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the relay's `/ws` endpoint.
    pub relay_url: String,

    /// ICE server URLs handed to the negotiation engine factory.
    pub ice_servers: Vec<String>,

    pub command_buffer: usize,

    pub event_buffer: usize,

    pub outbound_buffer: usize,

    /// Largest inbound frame accepted from the relay.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map (testable without touching the process env).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = vars.get("CALL_RELAY_URL") {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidValue(format!(
                    "CALL_RELAY_URL must be a ws:// or wss:// URL, got '{url}'"
                )));
            }
            config.relay_url.clone_from(url);
        }

        if let Some(servers) = vars.get("CALL_ICE_SERVERS") {
            let parsed: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if parsed.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "CALL_ICE_SERVERS must list at least one server".to_string(),
                ));
            }
            config.ice_servers = parsed;
        }

        if let Some(value) = vars.get("CALL_COMMAND_BUFFER") {
            config.command_buffer = parse_capacity("CALL_COMMAND_BUFFER", value)?;
        }

        if let Some(value) = vars.get("CALL_EVENT_BUFFER") {
            config.event_buffer = parse_capacity("CALL_EVENT_BUFFER", value)?;
        }

        Ok(config)
    }
}

fn parse_capacity(name: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue(format!(
            "{name} must be a positive integer, got '{value}'"
        ))),
    }
}
