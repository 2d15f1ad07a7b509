//! Identifier types for polls, voters and live connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Characters a session code may contain.
///
/// Uppercase letters and digits minus the visually ambiguous `0 O 1 I`.
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of every session code.
pub const SESSION_CODE_LENGTH: usize = 6;

/// Reasons a string is not a session code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionCodeError {
    #[error("session code must be {SESSION_CODE_LENGTH} characters, got {0}")]
    WrongLength(usize),

    #[error("session code contains a character outside the alphabet")]
    InvalidCharacter,
}

/// Short public identifier a participant types to find a poll.
///
/// Always [`SESSION_CODE_LENGTH`] characters from [`SESSION_CODE_ALPHABET`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Parse user input into a session code.
    ///
    /// Surrounding whitespace is ignored and lowercase letters are accepted,
    /// so `" ab23cd "` and `"AB23CD"` name the same poll.
    ///
    /// # Errors
    ///
    /// Returns [`SessionCodeError`] if the normalised input has the wrong
    /// length or a character outside the alphabet.
    pub fn parse(input: &str) -> Result<Self, SessionCodeError> {
        let normalized = input.trim().to_ascii_uppercase();

        let len = normalized.chars().count();
        if len != SESSION_CODE_LENGTH {
            return Err(SessionCodeError::WrongLength(len));
        }

        if !normalized
            .bytes()
            .all(|b| SESSION_CODE_ALPHABET.contains(&b))
        {
            return Err(SessionCodeError::InvalidCharacter);
        }

        Ok(Self(normalized))
    }

    /// Borrow the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = SessionCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

/// The value the one-vote rule keys on.
///
/// Supplied by the calling layer; the poll core only compares identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum VoterIdentity {
    /// Authenticated account id.
    Account(String),
    /// Server-issued anonymous voting token id, bound to one poll.
    Anonymous(String),
}

impl VoterIdentity {
    /// Stable string key used for storage indexes (`account:<id>` / `anonymous:<id>`).
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            VoterIdentity::Account(id) => format!("account:{id}"),
            VoterIdentity::Anonymous(id) => format!("anonymous:{id}"),
        }
    }
}

/// Identifier of one live connection subscribed to poll updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let code = SessionCode::parse("  ab23cd ").unwrap();
        assert_eq!(code.as_str(), "AB23CD");
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert_eq!(
            SessionCode::parse("ABC"),
            Err(SessionCodeError::WrongLength(3))
        );
        assert_eq!(
            SessionCode::parse("ABCDEFG"),
            Err(SessionCodeError::WrongLength(7))
        );
    }

    #[test]
    fn test_parse_rejects_ambiguous_characters() {
        // 0, O, 1 and I are excluded from the alphabet
        for input in ["AB0CDE", "ABOCDE", "AB1CDE", "ABICDE", "AB-CDE"] {
            assert_eq!(
                SessionCode::parse(input),
                Err(SessionCodeError::InvalidCharacter),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_alphabet_has_no_ambiguous_characters() {
        for ch in [b'0', b'O', b'1', b'I'] {
            assert!(!SESSION_CODE_ALPHABET.contains(&ch));
        }
        assert_eq!(SESSION_CODE_ALPHABET.len(), 32);
    }

    #[test]
    fn test_session_code_serde_validates() {
        let code: SessionCode = serde_json::from_str("\"xy7zab\"").unwrap();
        assert_eq!(code.as_str(), "XY7ZAB");
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"XY7ZAB\"");

        let bad: Result<SessionCode, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_voter_identity_storage_key() {
        assert_eq!(
            VoterIdentity::Account("alice".to_string()).storage_key(),
            "account:alice"
        );
        assert_eq!(
            VoterIdentity::Anonymous("t-1".to_string()).storage_key(),
            "anonymous:t-1"
        );
        assert_ne!(
            VoterIdentity::Account("x".to_string()),
            VoterIdentity::Anonymous("x".to_string())
        );
    }

    #[test]
    fn test_connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
