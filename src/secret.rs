//! Credential values that must not leak through logs or config dumps.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const REDACTED: &str = "<secret>";

/// A secret string (password, token, client secret, private key).
///
/// `Debug` never shows the value. Serialization writes the value as-is while
/// the secret is still part of the user-authored configuration, so that a
/// host can round-trip the configuration through JSON, and writes
/// `"<secret>"` once [`Secret::redacted`] has been applied. The only way to
/// read the value is [`Secret::expose`], called when a request is built.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret {
    value: String,
    redact: bool,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            redact: false,
        }
    }

    /// The same secret, serialized as a placeholder from now on.
    pub fn redacted(mut self) -> Self {
        self.redact = true;
        self
    }

    pub fn is_redacted(&self) -> bool {
        self.redact
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            f.write_str("Secret(\"\")")
        } else {
            write!(f, "Secret({REDACTED})")
        }
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.redact && !self.value.is_empty() {
            serializer.serialize_str(REDACTED)
        } else {
            serializer.serialize_str(&self.value)
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_value() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(<secret>)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_unredacted_round_trips_through_json() {
        let secret = Secret::new("hunter2");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, r#""hunter2""#);

        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expose(), "hunter2");
    }

    #[test]
    fn test_redacted_serializes_placeholder() {
        let secret = Secret::new("hunter2").redacted();
        assert!(secret.is_redacted());
        assert_eq!(serde_json::to_string(&secret).unwrap(), r#""<secret>""#);
        assert_eq!(secret.expose(), "hunter2");
    }
}
