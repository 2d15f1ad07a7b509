//! HTTP metrics middleware.
//!
//! Applied as the outermost layer so framework rejections (404, 405, 415,
//! JSON parse failures) are counted alongside handler responses.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Record method, normalized path, status and duration for every response.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_http_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::post,
        Router,
    };
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use tower::ServiceExt;

    async fn handler_201() -> StatusCode {
        StatusCode::CREATED
    }

    fn test_app() -> Router {
        Router::new()
            .route("/api/v1/polls", post(handler_201))
            .layer(middleware::from_fn(http_metrics_middleware))
    }

    #[tokio::test]
    async fn test_middleware_passes_response_through() {
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/polls")
            .body(Body::empty())
            .expect("request builder should succeed");

        let response = test_app()
            .oneshot(request)
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_middleware_counts_framework_rejections() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let request = HttpRequest::builder()
                    .method("GET")
                    .uri("/api/v1/polls")
                    .body(Body::empty())
                    .unwrap();
                let response = test_app().oneshot(request).await.unwrap();
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            });
        });

        let counted = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .any(|(key, _, _, value)| {
                let key = key.key();
                key.name() == "poll_http_requests_total"
                    && key
                        .labels()
                        .any(|l| l.key() == "endpoint" && l.value() == "/api/v1/polls")
                    && key
                        .labels()
                        .any(|l| l.key() == "status_code" && l.value() == "405")
                    && matches!(value, DebugValue::Counter(1))
            });
        assert!(counted, "405 should be recorded for the route");
    }
}
