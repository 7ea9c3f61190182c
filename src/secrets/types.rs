//! Redacting wrapper for resolved secret values and credential material.
//!
//! Anything that came out of a backend, or that is used to log in to one,
//! travels as a [`SecretString`] so it cannot end up in a log line or an
//! error message by accident.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const REDACTED: &str = "[REDACTED]";

/// A string whose contents are hidden from `Debug`, `Display` and `Serialize`.
///
/// The buffer is zeroed on drop. Reading the value requires an explicit
/// [`SecretString::expose_secret`] call.
///
/// ```rust,ignore
/// use latchkey::secrets::SecretString;
///
/// let password = SecretString::new("hunter2");
/// assert_eq!(format!("{:?}", password), "SecretString([REDACTED])");
/// assert_eq!(password.expose_secret(), "hunter2");
/// ```
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the raw value. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Take the raw value out; the emptied wrapper is still zeroed on drop.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Blank or whitespace-only credentials are treated as unset.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Credentials arrive through the settings loader as plain strings
        String::deserialize(deserializer).map(SecretString)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_value_is_redacted() {
        let value = SecretString::new("world");
        assert_eq!(format!("{:?}", value), "SecretString([REDACTED])");
        assert_eq!(value.to_string(), "[REDACTED]");
        assert_eq!(value.expose_secret(), "world");
    }

    #[test]
    fn test_credentials_redacted_inside_settings() {
        #[derive(Serialize, Deserialize)]
        struct Login {
            username: String,
            password: SecretString,
        }

        let login: Login =
            serde_json::from_str(r#"{"username":"svc","password":"p4ss"}"#).unwrap();
        assert_eq!(login.password.expose_secret(), "p4ss");

        let json = serde_json::to_string(&login).unwrap();
        assert!(json.contains("svc"));
        assert!(json.contains("[REDACTED]"));
        assert!(!json.contains("p4ss"));
    }

    #[test]
    fn test_blank_detection() {
        assert!(SecretString::new("   ").is_blank());
        assert!(SecretString::default().is_empty());
        assert!(!SecretString::new("t").is_blank());
        assert_eq!(SecretString::new("abc").len(), 3);
    }

    #[test]
    fn test_into_inner_and_equality() {
        let a: SecretString = "same".into();
        let b: SecretString = "same".to_string().into();
        assert_eq!(a, b);
        assert_eq!(a.clone().into_inner(), "same");
    }
}
