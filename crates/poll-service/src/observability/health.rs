//! Health endpoints for the poll service.
//!
//! Served on their own listener so probes and scrapes never queue behind
//! API traffic:
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (can we accept new polls?)
//! - `GET /metrics` - Prometheus text format, when a handle is supplied
//!
//! # Readiness
//!
//! Ready means startup finished, shutdown has not begun and, when a
//! [`PollService`] is attached, the service is still accepting polls. A
//! draining instance reports 503 so the load balancer moves new sessions
//! elsewhere while existing live connections are closed.

use crate::service::PollService;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness for the probes.
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    service: Option<PollService>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready, no service attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            service: None,
        }
    }

    /// Readiness also requires `service` to be accepting polls.
    #[must_use]
    pub fn for_service(service: PollService) -> Self {
        Self {
            service: Some(service),
            ..Self::new()
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self
                .service
                .as_ref()
                .map_or(true, PollService::is_accepting)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    live_polls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribers: Option<usize>,
}

/// Router for the health listener.
///
/// `/metrics` is only mounted when `metrics_handle` is given.
pub fn health_router(
    health_state: Arc<HealthState>,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match metrics_handle {
        Some(handle) => router.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        ),
        None => router,
    }
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Returns 200 with live counts when ready, 503 otherwise.
#[tracing::instrument(skip_all, name = "poll.health.ready")]
async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    if !state.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessBody {
                status: "not_ready",
                live_polls: None,
                subscribers: None,
            }),
        );
    }

    let (live_polls, subscribers) = match &state.service {
        Some(service) => {
            let status = service.status().await;
            (Some(status.live_polls), Some(status.subscribers))
        }
        None => (None, None),
    };

    (
        StatusCode::OK,
        Json(ReadinessBody {
            status: "ready",
            live_polls,
            subscribers,
        }),
    )
}

/// Prometheus scrape endpoint. No session codes or identities appear in
/// any label.
#[tracing::instrument(skip_all, name = "poll.metrics.scrape")]
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
