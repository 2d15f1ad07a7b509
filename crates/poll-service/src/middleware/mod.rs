//! HTTP middleware for the poll API.
//!
//! - `identity` - Lifts the upstream-authenticated account into the request
//! - `http_metrics` - HTTP request metrics

pub mod http_metrics;
pub mod identity;

pub use http_metrics::http_metrics_middleware;
pub use identity::{identity_from_headers, require_identity, IDENTITY_HEADER};
