//! Common types shared across the live poll crates.

#![warn(clippy::pedantic)]

/// Identifier types: session codes, voter identities, connection ids
pub mod types;

/// Secret types that prevent accidental logging
pub mod secret;
