// src/keys.rs

use crate::error::{RateLimiterError, Result};

/// Longest identifier accepted, in bytes
pub const MAX_IDENTIFIER_LEN: usize = 512;

/// Derives store keys for (algorithm, identifier[, window]).
///
/// Layout is `{prefix}:{algorithm}:{{identifier}}[:{window}]`. The braces make
/// the identifier a Redis Cluster hash tag so one client's keys share a slot.
/// The window marker is always a trailing run of digits after the closing
/// brace, so two different inputs can never produce the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new("ratelimit")
    }
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, algorithm: &str, identifier: &str) -> String {
        format!("{}:{}:{{{}}}", self.prefix, algorithm, identifier)
    }

    pub fn windowed_key(&self, algorithm: &str, identifier: &str, window: u64) -> String {
        format!("{}:{}:{{{}}}:{}", self.prefix, algorithm, identifier, window)
    }
}

/// Rejects identifiers that cannot name a client. No store round trip.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(RateLimiterError::InvalidIdentifier(
            "identifier must not be empty".to_string(),
        ));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(RateLimiterError::InvalidIdentifier(format!(
            "identifier is {} bytes, limit is {}",
            identifier.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if identifier.chars().any(char::is_control) {
        return Err(RateLimiterError::InvalidIdentifier(
            "identifier contains control characters".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyCodec::default();
        assert_eq!(
            keys.key("token_bucket", "1.2.3.4"),
            "ratelimit:token_bucket:{1.2.3.4}"
        );
        assert_eq!(
            keys.windowed_key("fixed_window", "1.2.3.4", 27_000),
            "ratelimit:fixed_window:{1.2.3.4}:27000"
        );
    }

    #[test]
    fn test_keys_do_not_collide_across_identifiers_and_windows() {
        let keys = KeyCodec::new("rl");

        // An identifier that looks like it carries a window marker
        let tricky = keys.windowed_key("fixed_window", "a:5", 7);
        let plain = keys.windowed_key("fixed_window", "a", 57);
        assert_ne!(tricky, plain);

        assert_ne!(
            keys.key("leaky_bucket", "client"),
            keys.key("token_bucket", "client")
        );
        assert_ne!(keys.key("sliding_log", "a}"), keys.key("sliding_log", "a"));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("10.0.0.1").is_ok());
        assert!(validate_identifier("api-key:abc").is_ok());

        assert!(matches!(
            validate_identifier(""),
            Err(RateLimiterError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            validate_identifier("   "),
            Err(RateLimiterError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            validate_identifier("bad\nid"),
            Err(RateLimiterError::InvalidIdentifier(_))
        ));

        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            validate_identifier(&long),
            Err(RateLimiterError::InvalidIdentifier(_))
        ));
    }
}
