//! Session code generation.
//!
//! Codes are [`SESSION_CODE_LENGTH`] characters drawn from
//! [`SESSION_CODE_ALPHABET`] using the system CSPRNG. The alphabet has exactly
//! 32 symbols, so the low five bits of each random byte select a character
//! without modulo bias.
//!
//! Uniqueness is not decided here. The registry retries a fresh candidate up
//! to [`MAX_CODE_ATTEMPTS`] times when a code is already live or stored.

use crate::errors::PollError;
use common::types::{SessionCode, SESSION_CODE_ALPHABET, SESSION_CODE_LENGTH};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum candidates tried before poll creation gives up.
pub const MAX_CODE_ATTEMPTS: usize = 8;

/// Produces session code candidates.
pub struct SessionCodeGenerator {
    source: CodeSource,
}

enum CodeSource {
    Random(SystemRandom),
    Sequence(Mutex<VecDeque<SessionCode>>),
}

impl SessionCodeGenerator {
    /// Generator backed by the system CSPRNG.
    #[must_use]
    pub fn random() -> Self {
        Self {
            source: CodeSource::Random(SystemRandom::new()),
        }
    }

    /// Generator that hands out the given codes in order, then fails.
    ///
    /// Used to make collision handling deterministic in tests.
    #[must_use]
    pub fn from_sequence(codes: impl IntoIterator<Item = SessionCode>) -> Self {
        Self {
            source: CodeSource::Sequence(Mutex::new(codes.into_iter().collect())),
        }
    }

    /// Produce the next candidate code.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Internal` if the CSPRNG fails or a scripted
    /// sequence is exhausted.
    pub fn generate(&self) -> Result<SessionCode, PollError> {
        match &self.source {
            CodeSource::Random(rng) => {
                let mut bytes = [0u8; SESSION_CODE_LENGTH];
                rng.fill(&mut bytes)
                    .map_err(|_| PollError::Internal("RNG failure".to_string()))?;

                let code: String = bytes
                    .iter()
                    .filter_map(|b| {
                        let idx = usize::from(*b) % SESSION_CODE_ALPHABET.len();
                        SESSION_CODE_ALPHABET.get(idx).map(|c| char::from(*c))
                    })
                    .collect();

                SessionCode::parse(&code)
                    .map_err(|e| PollError::Internal(format!("generated invalid code: {e}")))
            }
            CodeSource::Sequence(codes) => codes
                .lock()
                .map_err(|_| PollError::Internal("code sequence lock poisoned".to_string()))?
                .pop_front()
                .ok_or_else(|| PollError::Internal("code sequence exhausted".to_string())),
        }
    }
}

impl Default for SessionCodeGenerator {
    fn default() -> Self {
        Self::random()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_codes_are_well_formed() {
        let generator = SessionCodeGenerator::random();

        for _ in 0..200 {
            let code = generator.generate().unwrap();
            assert_eq!(code.as_str().len(), SESSION_CODE_LENGTH);
            assert!(code
                .as_str()
                .bytes()
                .all(|b| SESSION_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_random_codes_vary() {
        let generator = SessionCodeGenerator::random();
        let codes: HashSet<_> = (0..100).map(|_| generator.generate().unwrap()).collect();

        // 32^6 possible codes; 100 draws colliding more than once is not plausible
        assert!(codes.len() >= 99);
    }

    #[test]
    fn test_sequence_hands_out_in_order_then_fails() {
        let generator = SessionCodeGenerator::from_sequence([
            SessionCode::parse("AB23CD").unwrap(),
            SessionCode::parse("XY7ZAB").unwrap(),
        ]);

        assert_eq!(generator.generate().unwrap().as_str(), "AB23CD");
        assert_eq!(generator.generate().unwrap().as_str(), "XY7ZAB");
        assert!(matches!(
            generator.generate(),
            Err(PollError::Internal(_))
        ));
    }
}
