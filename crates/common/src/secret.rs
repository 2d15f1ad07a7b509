//! Secret types for values that must never reach a log line.
//!
//! Re-exports the [`secrecy`] types. `SecretBox<T>` and `SecretString` print
//! `[REDACTED]` under `Debug` and zeroize on drop, so a struct that derives
//! `Debug` over them is safe to hand to `tracing`.
//!
//! In this workspace:
//!
//! - `SecretString` holds the Redis URL (it may embed a password) and the
//!   base64 voting-token master secret as read from the environment.
//! - `SecretBox<Vec<u8>>` holds the decoded master secret that keys the
//!   per-poll HMAC for anonymous voting tokens.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@cache:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
