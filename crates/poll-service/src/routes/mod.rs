//! HTTP routes for the poll service.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::middleware::{http_metrics_middleware, require_identity};
use crate::service::PollService;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound on producing a response. Live streams are only bounded
/// until their headers are sent.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: PollService,
}

/// Build the API routes.
///
/// Creates an Axum router with:
/// - Public poll routes (browse, read, vote, voting token, live stream)
/// - Owner routes behind `require_identity` (create, list, stats, end, delete)
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/v1/polls", get(handlers::list_polls))
        .route("/api/v1/polls/:code", get(handlers::get_poll))
        .route("/api/v1/polls/:code/current", get(handlers::get_current))
        .route("/api/v1/polls/:code/vote", post(handlers::vote))
        .route(
            "/api/v1/polls/:code/voting-token",
            post(handlers::issue_voting_token),
        )
        .route("/api/v1/polls/:code/live", get(handlers::live_updates))
        .with_state(Arc::clone(&state));

    let owner_routes = Router::new()
        .route("/api/v1/polls", post(handlers::create_poll))
        .route("/api/v1/polls/mine", get(handlers::list_my_polls))
        .route("/api/v1/polls/stats", get(handlers::my_stats))
        .route(
            "/api/v1/polls/:code",
            axum::routing::delete(handlers::delete_poll),
        )
        .route("/api/v1/polls/:code/end", post(handlers::end_poll))
        .route_layer(middleware::from_fn(require_identity))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    public_routes
        .merge(owner_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(http_metrics_middleware))
}
