//! Identity types carried on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Maximum accepted length of a user identifier, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Stable logical user identifier supplied by the authentication layer.
///
/// The relay does not interpret the value beyond basic well-formedness:
/// non-empty, at most [`MAX_USER_ID_LEN`] bytes, no whitespace or control
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parse and validate a user identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidUserId`] if the value is empty, too long,
    /// or contains whitespace/control characters.
    pub fn parse(value: impl Into<String>) -> Result<Self, ProtocolError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProtocolError::InvalidUserId("empty".to_string()));
        }
        if value.len() > MAX_USER_ID_LEN {
            return Err(ProtocolError::InvalidUserId(format!(
                "length {} exceeds {MAX_USER_ID_LEN}",
                value.len()
            )));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidUserId(
                "contains whitespace or control characters".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a user in the telehealth application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Doctor,
    Patient,
}

/// Display profile attached to an invite so the callee can render the
/// incoming-call prompt.
///
/// Supplied by the authentication layer and relayed as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    pub id: UserId,
    pub name: String,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization: Option<String>,
}

impl CallerProfile {
    /// Minimal profile with only the required fields.
    #[must_use]
    pub fn new(id: UserId, name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            profile_picture: None,
            specialization: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_accepts_object_id_style_values() {
        let id = UserId::parse("64f1c2a9e4b0a1b2c3d4e5f6").expect("valid id");
        assert_eq!(id.as_str(), "64f1c2a9e4b0a1b2c3d4e5f6");
        assert_eq!(id.to_string(), "64f1c2a9e4b0a1b2c3d4e5f6");
    }

    #[test]
    fn test_user_id_rejects_malformed_values() {
        assert!(matches!(
            UserId::parse(""),
            Err(ProtocolError::InvalidUserId(_))
        ));
        assert!(UserId::parse("doc 1").is_err());
        assert!(UserId::parse("doc\n1").is_err());
        assert!(UserId::parse("x".repeat(MAX_USER_ID_LEN + 1)).is_err());
        assert!(UserId::parse("x".repeat(MAX_USER_ID_LEN)).is_ok());
    }

    #[test]
    fn test_user_id_deserialization_validates() {
        let ok: UserId = serde_json::from_str("\"pat1\"").unwrap();
        assert_eq!(ok.as_str(), "pat1");

        let err = serde_json::from_str::<UserId>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_caller_profile_omits_absent_optional_fields() {
        let profile = CallerProfile::new(UserId::parse("doc1").unwrap(), "Dr. Rao", UserRole::Doctor);
        let json = serde_json::to_value(&profile).unwrap();

        assert_eq!(json["id"], "doc1");
        assert_eq!(json["role"], "doctor");
        assert!(json.get("profile_picture").is_none());
        assert!(json.get("specialization").is_none());
    }
}
