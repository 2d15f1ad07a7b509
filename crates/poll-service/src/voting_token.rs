//! Anonymous voting tokens.
//!
//! Voters without an account get a server-issued token bound to one poll.
//! The token ID becomes their [`VoterIdentity::Anonymous`] identity, so the
//! one-vote rule keys on something the server minted rather than on a
//! display name the client chose.
//!
//! - **Key derivation**: `HKDF-SHA256(master_secret, salt=session_code, info="poll-voting-token")`
//! - **Token**: `HMAC-SHA256(poll_key, session_code || ":" || token_id)`
//! - **Validation**: constant-time via `ring::hmac::verify`

use crate::errors::PollError;
use common::secret::{ExposeSecret, SecretBox};
use common::types::{SessionCode, VoterIdentity};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac};
use serde::{Deserialize, Serialize};

/// Minimum master secret length in bytes.
pub const MIN_MASTER_SECRET_BYTES: usize = 32;

const TOKEN_INFO: &[u8] = b"poll-voting-token";

/// A voting token handed to an anonymous participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingToken {
    /// Random identifier; becomes the voter's anonymous identity.
    pub token_id: String,
    /// Hex-encoded HMAC proving the server issued `token_id` for this poll.
    pub token: String,
}

impl VotingToken {
    /// The identity a vote cast with this token is recorded under.
    #[must_use]
    pub fn identity(&self) -> VoterIdentity {
        VoterIdentity::Anonymous(self.token_id.clone())
    }
}

/// Issues and verifies [`VotingToken`]s.
pub struct VotingTokenIssuer {
    master_secret: SecretBox<Vec<u8>>,
    rng: SystemRandom,
}

impl VotingTokenIssuer {
    /// Create an issuer keyed by `master_secret`.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Config` if the secret is shorter than
    /// [`MIN_MASTER_SECRET_BYTES`].
    pub fn new(master_secret: SecretBox<Vec<u8>>) -> Result<Self, PollError> {
        if master_secret.expose_secret().len() < MIN_MASTER_SECRET_BYTES {
            return Err(PollError::Config(format!(
                "voting token secret must be at least {MIN_MASTER_SECRET_BYTES} bytes"
            )));
        }
        Ok(Self {
            master_secret,
            rng: SystemRandom::new(),
        })
    }

    /// Mint a token for `code`.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Internal` if the CSPRNG or key derivation fails.
    pub fn issue(&self, code: &SessionCode) -> Result<VotingToken, PollError> {
        let mut id_bytes = [0u8; 16];
        self.rng
            .fill(&mut id_bytes)
            .map_err(|_| PollError::Internal("RNG failure".to_string()))?;
        let token_id = hex::encode(id_bytes);

        let key = self.poll_key(code)?;
        let tag = hmac::sign(&key, message(code, &token_id).as_bytes());

        Ok(VotingToken {
            token_id,
            token: hex::encode(tag.as_ref()),
        })
    }

    /// Check that `token` was issued for `code`.
    ///
    /// # Errors
    ///
    /// Returns `PollError::InvalidVotingToken` if verification fails.
    pub fn verify(&self, code: &SessionCode, token: &VotingToken) -> Result<(), PollError> {
        let provided = hex::decode(&token.token).map_err(|_| PollError::InvalidVotingToken)?;
        let key = self
            .poll_key(code)
            .map_err(|_| PollError::InvalidVotingToken)?;

        hmac::verify(&key, message(code, &token.token_id).as_bytes(), &provided)
            .map_err(|_| PollError::InvalidVotingToken)
    }

    /// Derive the per-poll HMAC key.
    fn poll_key(&self, code: &SessionCode) -> Result<hmac::Key, PollError> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, code.as_str().as_bytes());
        let prk = salt.extract(self.master_secret.expose_secret());
        let okm = prk
            .expand(&[TOKEN_INFO], PollKeyLen)
            .map_err(|_| PollError::Internal("HKDF expand failed".to_string()))?;

        let mut key = [0u8; 32];
        okm.fill(&mut key)
            .map_err(|_| PollError::Internal("HKDF fill failed".to_string()))?;
        Ok(hmac::Key::new(hmac::HMAC_SHA256, &key))
    }
}

fn message(code: &SessionCode, token_id: &str) -> String {
    format!("{code}:{token_id}")
}

/// HKDF output key length for poll keys.
struct PollKeyLen;

impl hkdf::KeyType for PollKeyLen {
    fn len(&self) -> usize {
        32
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn issuer_with(byte: u8) -> VotingTokenIssuer {
        VotingTokenIssuer::new(SecretBox::new(Box::new(vec![byte; 32]))).unwrap()
    }

    fn code(raw: &str) -> SessionCode {
        SessionCode::parse(raw).unwrap()
    }

    #[test]
    fn test_issue_then_verify() {
        let issuer = issuer_with(0x42);
        let token = issuer.issue(&code("AB23CD")).unwrap();

        assert_eq!(token.token_id.len(), 32);
        assert_eq!(token.token.len(), 64); // SHA256 = 32 bytes = 64 hex chars
        assert!(issuer.verify(&code("AB23CD"), &token).is_ok());
        assert_eq!(
            token.identity(),
            VoterIdentity::Anonymous(token.token_id.clone())
        );
    }

    #[test]
    fn test_token_ids_are_unique() {
        let issuer = issuer_with(0x42);
        let a = issuer.issue(&code("AB23CD")).unwrap();
        let b = issuer.issue(&code("AB23CD")).unwrap();
        assert_ne!(a.token_id, b.token_id);
    }

    #[test]
    fn test_token_is_bound_to_poll() {
        let issuer = issuer_with(0x42);
        let token = issuer.issue(&code("AB23CD")).unwrap();

        assert!(matches!(
            issuer.verify(&code("XY7ZAB"), &token),
            Err(PollError::InvalidVotingToken)
        ));
    }

    #[test]
    fn test_forged_token_id_is_rejected() {
        let issuer = issuer_with(0x42);
        let mut token = issuer.issue(&code("AB23CD")).unwrap();
        token.token_id = "alice".to_string();

        assert!(matches!(
            issuer.verify(&code("AB23CD"), &token),
            Err(PollError::InvalidVotingToken)
        ));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        let issuer = issuer_with(0x42);
        let token = VotingToken {
            token_id: "abc".to_string(),
            token: "not-hex".to_string(),
        };
        assert!(issuer.verify(&code("AB23CD"), &token).is_err());

        let token = VotingToken {
            token_id: "abc".to_string(),
            token: "abcd".to_string(),
        };
        assert!(issuer.verify(&code("AB23CD"), &token).is_err());
    }

    #[test]
    fn test_different_secrets_do_not_cross_verify() {
        let token = issuer_with(0x01).issue(&code("AB23CD")).unwrap();
        assert!(issuer_with(0x02).verify(&code("AB23CD"), &token).is_err());
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let result = VotingTokenIssuer::new(SecretBox::new(Box::new(vec![0u8; 16])));
        assert!(matches!(result, Err(PollError::Config(_))));
    }
}
