//! Metrics definitions for the poll service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `poll_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 2 values (poll, subscriber)
//! - `outcome`: bounded by `PollError::metric_label` plus `accepted`
//! - `operation`: bounded by storage and service operations (~10 values)
//! - `endpoint`: normalized, session codes replaced by `{code}`
//! - `reason`: bounded by `EndReason` and retirement reasons
//!
//! Session codes and identities are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Vote latency buckets - in-memory path plus optional write-through
        .set_buckets_for_metric(
            Matcher::Prefix("poll_vote".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set vote latency buckets: {e}"))?
        // Storage latency buckets - internal service call
        .set_buckets_for_metric(
            Matcher::Prefix("poll_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set storage latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Poll & Subscriber Metrics (Gauges)
// ============================================================================

/// Set the number of live polls held in memory.
///
/// Metric: `poll_polls_active`
pub fn set_polls_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("poll_polls_active").set(count as f64);
}

/// Set the number of live subscriptions across all polls.
///
/// Metric: `poll_subscribers_active`
pub fn set_subscribers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("poll_subscribers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `poll_actor_mailbox_depth`
/// Labels: `actor_type` (poll, subscriber)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("poll_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Poll Lifecycle Metrics (Counters)
// ============================================================================

/// Record a poll creation.
///
/// Metric: `poll_polls_created_total`
pub fn record_poll_created() {
    counter!("poll_polls_created_total").increment(1);
}

/// Record a poll moving to ended.
///
/// Metric: `poll_polls_ended_total`
/// Labels: `reason` (owner, expired, abandoned)
pub fn record_poll_ended(reason: &str) {
    counter!("poll_polls_ended_total", "reason" => reason.to_string()).increment(1);
}

/// Record a poll leaving memory.
///
/// Metric: `poll_polls_retired_total`
/// Labels: `reason` (abandoned, idle, evicted, ended, deleted, failed)
pub fn record_poll_retired(reason: &str) {
    counter!("poll_polls_retired_total", "reason" => reason.to_string()).increment(1);
}

/// Record a session code candidate that was already taken.
///
/// Metric: `poll_code_collisions_total`
pub fn record_code_collision() {
    counter!("poll_code_collisions_total").increment(1);
}

// ============================================================================
// Vote Metrics
// ============================================================================

/// Record a vote attempt and how long the poll took to answer it.
///
/// Metrics: `poll_votes_total`, `poll_vote_duration_seconds`
/// Labels: `outcome` (accepted, duplicate, invalid_option, ended, ...)
pub fn record_vote(outcome: &str, duration: Duration) {
    counter!("poll_votes_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("poll_vote_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Fan-out Metrics
// ============================================================================

/// Record a subscriber removed because its connection stopped accepting events.
///
/// Metric: `poll_broadcast_failures_total`
pub fn record_broadcast_failure() {
    counter!("poll_broadcast_failures_total").increment(1);
}

// ============================================================================
// Storage Metrics
// ============================================================================

/// Record a durable storage operation.
///
/// Metrics: `poll_store_operations_total`, `poll_store_duration_seconds`
/// Labels: `operation` (save, load, delete, list), `status` (success, error)
pub fn record_store_operation(operation: &str, status: &str, duration: Duration) {
    counter!(
        "poll_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("poll_store_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// HTTP Metrics
// ============================================================================

/// Paths under `/api/v1/polls/{code}` that carry an action segment.
const POLL_ACTIONS: &[&str] = &["current", "vote", "voting-token", "end", "live"];

/// Record an HTTP request.
///
/// Metrics: `poll_http_requests_total`, `poll_http_request_duration_seconds`
/// Labels: `method`, `endpoint` (normalized), `status_code` / `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("poll_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint.clone(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("poll_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Replace session codes in a path with `{code}`.
///
/// Unknown paths collapse to `/other`.
fn normalize_endpoint(path: &str) -> String {
    match path {
        "/health" | "/ready" | "/metrics" | "/api/v1/polls" | "/api/v1/polls/mine"
        | "/api/v1/polls/stats" => return path.to_string(),
        _ => {}
    }

    let Some(rest) = path.strip_prefix("/api/v1/polls/") else {
        return "/other".to_string();
    };

    let mut segments = rest.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(code), None, None) if !code.is_empty() => "/api/v1/polls/{code}".to_string(),
        (Some(code), Some(action), None) if !code.is_empty() && POLL_ACTIONS.contains(&action) => {
            format!("/api/v1/polls/{{code}}/{action}")
        }
        _ => "/other".to_string(),
    }
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record an actor panic.
///
/// Metric: `poll_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("poll_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an operation that timed out waiting for its poll.
///
/// Metric: `poll_operation_timeouts_total`
/// Labels: `operation`
pub fn record_operation_timeout(operation: &str) {
    counter!("poll_operation_timeouts_total", "operation" => operation.to_string())
        .increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // The metrics crate records to a no-op recorder when none is installed,
    // so these only exercise the recording paths.

    #[test]
    fn test_gauges_accept_any_count() {
        set_polls_active(0);
        set_polls_active(10_000);
        set_subscribers_active(0);
        set_subscribers_active(250_000);
        set_actor_mailbox_depth("poll", 50);
        set_actor_mailbox_depth("subscriber", 200);
    }

    #[test]
    fn test_counters_and_histograms() {
        record_poll_created();
        record_poll_ended("owner");
        record_poll_retired("abandoned");
        record_code_collision();
        record_vote("accepted", Duration::from_micros(300));
        record_vote("duplicate", Duration::from_micros(120));
        record_broadcast_failure();
        record_store_operation("save", "success", Duration::from_millis(2));
        record_actor_panic("poll");
        record_operation_timeout("vote");
        record_http_request("POST", "/api/v1/polls/AB23CD/vote", 200, Duration::from_millis(3));
        record_http_request("GET", "/api/v1/polls/AB23CD", 404, Duration::from_millis(1));
    }

    #[test]
    fn test_normalize_endpoint_hides_session_codes() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/api/v1/polls"), "/api/v1/polls");
        assert_eq!(normalize_endpoint("/api/v1/polls/mine"), "/api/v1/polls/mine");
        assert_eq!(
            normalize_endpoint("/api/v1/polls/AB23CD"),
            "/api/v1/polls/{code}"
        );
        assert_eq!(
            normalize_endpoint("/api/v1/polls/XY7ZAB/voting-token"),
            "/api/v1/polls/{code}/voting-token"
        );
        assert_eq!(normalize_endpoint("/api/v1/polls/XY7ZAB/unknown"), "/other");
        assert_eq!(normalize_endpoint("/api/v1/polls/A/B/C"), "/other");
        assert_eq!(normalize_endpoint("/wp-admin"), "/other");
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(201), "success");
        assert_eq!(categorize_status_code(504), "timeout");
        assert_eq!(categorize_status_code(409), "error");
    }

    #[test]
    fn test_vote_metrics_are_labelled_by_outcome() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_vote("accepted", Duration::from_millis(1));
            record_vote("accepted", Duration::from_millis(1));
            record_vote("duplicate", Duration::from_millis(1));
        });

        let accepted = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                let key = key.key();
                let is_accepted = key.name() == "poll_votes_total"
                    && key
                        .labels()
                        .any(|l| l.key() == "outcome" && l.value() == "accepted");
                match value {
                    DebugValue::Counter(n) if is_accepted => Some(n),
                    _ => None,
                }
            });

        assert_eq!(accepted, Some(2));
    }
}
