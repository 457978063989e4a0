use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Random bytes behind every token id.
pub const TOKEN_BYTES: usize = 16;
/// Anything longer is rejected before the store is consulted.
pub const MAX_TOKEN_LEN: usize = 64;

/// Fresh unguessable token id: 128 random bits, base64url without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn is_well_formed(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Prefix safe to put in logs.
pub fn short(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(6)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

fn default_max() -> u32 {
    1
}

/// Budget record of one token.
///
/// `remaining` only goes down. `exhausted_at` is present exactly when
/// `remaining == 0` and is written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default)]
    pub remaining: u32,
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default)]
    pub exhausted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(max: u32, now: DateTime<Utc>) -> Self {
        Self {
            remaining: max,
            max,
            exhausted_at: None,
            created_at: now,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// The record after one more redemption, or `None` if nothing is left.
    pub fn consume(&self, now: DateTime<Utc>) -> Option<TokenRecord> {
        let remaining = self.remaining.checked_sub(1)?;
        Some(TokenRecord {
            remaining,
            max: self.max,
            exhausted_at: if remaining == 0 { Some(now) } else { None },
            created_at: self.created_at,
        })
    }

    pub fn message(&self) -> String {
        if self.remaining > 0 {
            format!("{} download(s) left", self.remaining)
        } else {
            "This code has already been used.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_generated_tokens_are_url_safe_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 22);
        assert!(is_well_formed(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn test_well_formed() {
        assert!(is_well_formed("abc-DEF_123"));
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("../secret"));
        assert!(!is_well_formed("has space"));
        assert!(!is_well_formed(&"a".repeat(MAX_TOKEN_LEN + 1)));
    }

    #[test]
    fn test_short_prefix() {
        assert_eq!(short("abcdefghij"), "abcdef");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_consume_walks_down_to_exhaustion() {
        let created = Utc::now();
        let mut record = TokenRecord::new(3, created);

        for expected in [2, 1] {
            record = record.consume(created + Duration::seconds(1)).unwrap();
            assert_eq!(record.remaining, expected);
            assert!(record.exhausted_at.is_none());
        }

        let exhausted_at = created + Duration::seconds(5);
        record = record.consume(exhausted_at).unwrap();
        assert_eq!(record.remaining, 0);
        assert_eq!(record.exhausted_at, Some(exhausted_at));
        assert_eq!(record.created_at, created);
        assert_eq!(record.max, 3);

        assert!(record.consume(created + Duration::seconds(9)).is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let created = "2025-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let record = TokenRecord::new(2, created);
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "remaining": 2,
                "max": 2,
                "exhausted_at": null,
                "created_at": "2025-06-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let record: TokenRecord =
            serde_json::from_str(r#"{"created_at":"2025-06-01T12:00:00.000Z"}"#).unwrap();
        assert_eq!(record.remaining, 0);
        assert_eq!(record.max, 1);
        assert!(record.exhausted_at.is_none());
    }

    #[test]
    fn test_status_message() {
        let mut record = TokenRecord::new(2, Utc::now());
        assert_eq!(record.message(), "2 download(s) left");
        record.remaining = 0;
        assert_eq!(record.message(), "This code has already been used.");
    }
}
