//! Poll service error types.
//!
//! Every operation reports one of these variants. Variants map to stable
//! string codes and HTTP statuses for the API boundary. Internal details are
//! logged server-side but not exposed to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Poll service error type.
///
/// HTTP mapping:
/// - `Validation`: 400
/// - `NotAuthorized`, `InvalidVotingToken`: 403
/// - `NotFound`: 404
/// - `DuplicateVote`: 409
/// - `PollEnded`: 410
/// - `InvalidOption`: 422
/// - `CapacityExceeded`, `Timeout`, `Draining`, `Storage`: 503
/// - `Config`, `Internal`: 500
#[derive(Debug, Error)]
pub enum PollError {
    /// Input rejected before any state was touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No live or stored poll under this code.
    #[error("Poll not found: {0}")]
    NotFound(String),

    /// The identity already has a recorded vote in this poll.
    #[error("Identity has already voted in this poll")]
    DuplicateVote,

    /// Option index outside the poll's option list.
    #[error("Invalid option index {index} for poll with {option_count} options")]
    InvalidOption { index: usize, option_count: usize },

    /// The poll is ended and no longer accepts mutations.
    #[error("Poll has ended")]
    PollEnded,

    /// Caller is not allowed to perform the operation.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Anonymous voting token failed verification.
    #[error("Invalid voting token")]
    InvalidVotingToken,

    /// The service holds its maximum number of live polls.
    #[error("Active poll capacity exceeded")]
    CapacityExceeded,

    /// The poll did not answer within the operation deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Service is shutting down.
    #[error("Service is draining")]
    Draining,

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PollError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            PollError::Validation(_) => "VALIDATION_ERROR",
            PollError::NotFound(_) => "NOT_FOUND",
            PollError::DuplicateVote => "DUPLICATE_VOTE",
            PollError::InvalidOption { .. } => "INVALID_OPTION",
            PollError::PollEnded => "POLL_ENDED",
            PollError::NotAuthorized(_) => "NOT_AUTHORIZED",
            PollError::InvalidVotingToken => "INVALID_VOTING_TOKEN",
            PollError::CapacityExceeded => "CAPACITY_EXCEEDED",
            PollError::Timeout(_) => "TIMEOUT",
            PollError::Draining => "DRAINING",
            PollError::Storage(_) => "STORAGE_ERROR",
            PollError::Config(_) | PollError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            PollError::Validation(_) => StatusCode::BAD_REQUEST,
            PollError::NotAuthorized(_) | PollError::InvalidVotingToken => StatusCode::FORBIDDEN,
            PollError::NotFound(_) => StatusCode::NOT_FOUND,
            PollError::DuplicateVote => StatusCode::CONFLICT,
            PollError::PollEnded => StatusCode::GONE,
            PollError::InvalidOption { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PollError::CapacityExceeded
            | PollError::Timeout(_)
            | PollError::Draining
            | PollError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            PollError::Config(_) | PollError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            PollError::Validation(msg) | PollError::NotAuthorized(msg) => msg.clone(),
            PollError::NotFound(_) => "Poll not found".to_string(),
            PollError::DuplicateVote => "You have already voted in this poll".to_string(),
            PollError::InvalidOption { .. } => self.to_string(),
            PollError::PollEnded => "This poll has ended".to_string(),
            PollError::InvalidVotingToken => "Invalid voting token".to_string(),
            PollError::CapacityExceeded => {
                "Server is at capacity, please try again later".to_string()
            }
            PollError::Timeout(_) => "The poll is busy, please try again".to_string(),
            PollError::Draining => "Server is shutting down, please reconnect".to_string(),
            PollError::Storage(_) | PollError::Config(_) | PollError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, PollError::Timeout(_) | PollError::Storage(_))
    }

    /// Short label used for outcome metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            PollError::Validation(_) => "validation",
            PollError::NotFound(_) => "not_found",
            PollError::DuplicateVote => "duplicate",
            PollError::InvalidOption { .. } => "invalid_option",
            PollError::PollEnded => "ended",
            PollError::NotAuthorized(_) | PollError::InvalidVotingToken => "not_authorized",
            PollError::CapacityExceeded => "capacity",
            PollError::Timeout(_) => "timeout",
            PollError::Draining => "draining",
            PollError::Storage(_) => "storage",
            PollError::Config(_) | PollError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            PollError::Storage(err) => {
                tracing::error!(target: "poll.api", error = %err, "Storage operation failed");
            }
            PollError::Config(err) | PollError::Internal(err) => {
                tracing::error!(target: "poll.api", error = %err, "Internal error");
            }
            PollError::Timeout(what) => {
                tracing::warn!(target: "poll.api", operation = %what, "Poll operation timed out");
            }
            _ => {}
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(PollError::DuplicateVote.error_code(), "DUPLICATE_VOTE");
        assert_eq!(PollError::PollEnded.error_code(), "POLL_ENDED");
        assert_eq!(
            PollError::InvalidOption {
                index: 5,
                option_count: 2
            }
            .error_code(),
            "INVALID_OPTION"
        );
        assert_eq!(
            PollError::Internal("boom".to_string()).error_code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PollError::Validation("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PollError::NotFound("AB23CD".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(PollError::DuplicateVote.status_code(), StatusCode::CONFLICT);
        assert_eq!(PollError::PollEnded.status_code(), StatusCode::GONE);
        assert_eq!(
            PollError::InvalidVotingToken.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            PollError::Timeout("vote".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let error = PollError::Storage("redis://:secret@host refused".to_string());
        assert_eq!(error.client_message(), "An internal error occurred");

        let error = PollError::Internal("actor channel closed".to_string());
        assert_eq!(error.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_invalid_option_message_is_verbatim() {
        let error = PollError::InvalidOption {
            index: 7,
            option_count: 3,
        };
        assert_eq!(
            error.client_message(),
            "Invalid option index 7 for poll with 3 options"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(PollError::Timeout("vote".to_string()).is_retryable());
        assert!(PollError::Storage("down".to_string()).is_retryable());
        assert!(!PollError::DuplicateVote.is_retryable());
        assert!(!PollError::PollEnded.is_retryable());
    }

    #[tokio::test]
    async fn test_into_response_body_shape() {
        let response = PollError::DuplicateVote.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "DUPLICATE_VOTE");
        assert_eq!(body["error"]["message"], "You have already voted in this poll");
    }

    #[tokio::test]
    async fn test_into_response_storage_is_generic() {
        let response = PollError::Storage("connection reset".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "STORAGE_ERROR");
        assert!(!body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
    }
}
