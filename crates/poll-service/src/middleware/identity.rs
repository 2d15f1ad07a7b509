//! Caller identity middleware.
//!
//! Authentication happens upstream. A trusted auth proxy sets the
//! `x-poll-identity` header to the caller's account id; this layer only
//! lifts it into a [`VoterIdentity`] in the request extensions. Anonymous
//! voters never use this header. They vote with a server-issued voting
//! token instead, so a client cannot claim another voter's identity.

use crate::errors::PollError;
use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::IntoResponse,
};
use common::types::VoterIdentity;
use tracing::instrument;

/// Header carrying the authenticated account id.
pub const IDENTITY_HEADER: &str = "x-poll-identity";

/// Longest account id accepted from the header.
pub const MAX_IDENTITY_LENGTH: usize = 128;

/// Read the account identity from `headers`.
///
/// Returns `Ok(None)` when the header is absent.
///
/// # Errors
///
/// `NotAuthorized` if the header is present but blank, oversized or not
/// visible ASCII.
pub fn identity_from_headers(headers: &HeaderMap) -> Result<Option<VoterIdentity>, PollError> {
    let Some(value) = headers.get(IDENTITY_HEADER) else {
        return Ok(None);
    };

    let id = value
        .to_str()
        .map(str::trim)
        .map_err(|_| invalid_identity())?;

    if id.is_empty() || id.len() > MAX_IDENTITY_LENGTH {
        return Err(invalid_identity());
    }

    Ok(Some(VoterIdentity::Account(id.to_string())))
}

fn invalid_identity() -> PollError {
    tracing::debug!(target: "poll.middleware.identity", "Malformed identity header");
    PollError::NotAuthorized("Invalid identity".to_string())
}

/// Reject requests without an account identity.
///
/// On success the [`VoterIdentity`] is available to handlers through
/// `Extension<VoterIdentity>`.
#[instrument(skip_all, name = "poll.middleware.identity")]
pub async fn require_identity(
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, PollError> {
    let identity = identity_from_headers(req.headers())?.ok_or_else(|| {
        tracing::debug!(target: "poll.middleware.identity", "Missing identity header");
        PollError::NotAuthorized("Sign in required".to_string())
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
