//! Relay service configuration.
//!
//! Configuration is loaded from environment variables with defaults suitable
//! for local development.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use signaling_protocol::codec::DEFAULT_MAX_FRAME_BYTES;

/// Default WebSocket (signaling) bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:5000";

/// Default health/metrics endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default per-connection outbound frame buffer.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Default relay actor mailbox size.
pub const DEFAULT_MAILBOX_BUFFER: usize = 1000;

/// Default relay instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "relay";

/// Relay service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signaling (WebSocket) bind address (default: "0.0.0.0:5000").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Outbound frames buffered per connection before frames are dropped.
    pub channel_buffer: usize,

    /// Relay actor mailbox capacity.
    pub mailbox_buffer: usize,

    /// Largest inbound text frame accepted, in bytes.
    pub max_frame_bytes: usize,

    /// Unique identifier for this relay instance (log correlation).
    pub instance_id: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            health_bind_address: DEFAULT_HEALTH_BIND_ADDRESS.to_string(),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            mailbox_buffer: DEFAULT_MAILBOX_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            instance_id: format!("{DEFAULT_INSTANCE_ID_PREFIX}-local"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RELAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let channel_buffer = parse_positive(vars, "RELAY_CHANNEL_BUFFER", DEFAULT_CHANNEL_BUFFER)?;
        let mailbox_buffer = parse_positive(vars, "RELAY_MAILBOX_BUFFER", DEFAULT_MAILBOX_BUFFER)?;
        let max_frame_bytes =
            parse_positive(vars, "RELAY_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?;

        // Generate instance ID
        let instance_id = vars.get("RELAY_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            channel_buffer,
            mailbox_buffer,
            max_frame_bytes,
            instance_id,
        })
    }
}

/// Parse an optional, strictly positive numeric variable.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => Ok(value),
            _ => Err(ConfigError::InvalidValue(format!(
                "{key} must be a positive integer, got '{raw}'"
            ))),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.channel_buffer, DEFAULT_CHANNEL_BUFFER);
        assert_eq!(config.mailbox_buffer, DEFAULT_MAILBOX_BUFFER);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("relay-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:5001".to_string()),
            (
                "RELAY_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:8082".to_string(),
            ),
            ("RELAY_CHANNEL_BUFFER".to_string(), "64".to_string()),
            ("RELAY_MAILBOX_BUFFER".to_string(), "500".to_string()),
            ("RELAY_MAX_FRAME_BYTES".to_string(), "8192".to_string()),
            ("RELAY_INSTANCE_ID".to_string(), "relay-custom-001".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:5001");
        assert_eq!(config.health_bind_address, "127.0.0.1:8082");
        assert_eq!(config.channel_buffer, 64);
        assert_eq!(config.mailbox_buffer, 500);
        assert_eq!(config.max_frame_bytes, 8192);
        assert_eq!(config.instance_id, "relay-custom-001");
    }

    #[test]
    fn test_from_vars_rejects_non_numeric_buffer() {
        let vars = HashMap::from([("RELAY_CHANNEL_BUFFER".to_string(), "lots".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("RELAY_CHANNEL_BUFFER"))
        );
    }

    #[test]
    fn test_from_vars_rejects_zero() {
        let vars = HashMap::from([("RELAY_MAILBOX_BUFFER".to_string(), "0".to_string())]);

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
