//! Integration tests for the poll HTTP API.
//!
//! Drives the full router (identity middleware, handlers, error mapping and
//! the SSE live stream) in-process with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use poll_service::middleware::IDENTITY_HEADER;
use poll_service::routes::{build_routes, AppState};
use poll_test_utils::{ephemeral_service, EVENT_TIMEOUT};
use serde_json::{json, Value};
use tower::ServiceExt;

// ============================================================================
// Helpers
// ============================================================================

fn app() -> Router {
    build_routes(Arc::new(AppState {
        service: ephemeral_service(),
    }))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    identity: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(identity) = identity {
        builder = builder.header(IDENTITY_HEADER, identity);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Create "Coffee or tea?" as `owner` and return its session code.
async fn create_poll(app: &Router, owner: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/polls",
        Some(owner),
        Some(json!({ "question": "Coffee or tea?", "options": ["Coffee", "Tea"] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
    body["sessionCode"].as_str().unwrap().to_string()
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

// ============================================================================
// Create and read
// ============================================================================

#[tokio::test]
async fn test_create_poll_returns_code_and_snapshot() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/polls",
        Some("owner"),
        Some(json!({ "question": "  Lunch?  ", "options": ["Pizza", "Salad", "Soup"] })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let code = body["sessionCode"].as_str().unwrap();
    assert_eq!(code.len(), 6);
    assert_eq!(body["poll"]["sessionCode"], code);
    assert_eq!(body["poll"]["question"], "Lunch?");
    assert_eq!(body["poll"]["tally"], json!([0, 0, 0]));
    assert_eq!(body["poll"]["status"], "active");
}

#[tokio::test]
async fn test_create_requires_identity() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/polls",
        None,
        Some(json!({ "question": "Q?", "options": ["A", "B"] })),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "NOT_AUTHORIZED");
}

#[tokio::test]
async fn test_create_rejects_bad_input() {
    let app = app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/polls",
        Some("owner"),
        Some(json!({ "question": "Q?", "options": ["Only one"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "VALIDATION_ERROR");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/polls",
        Some("owner"),
        Some(json!({ "question": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_poll_normalizes_code() {
    let app = app();
    let code = create_poll(&app, "owner").await;

    let lowercase = code.to_ascii_lowercase();
    let (status, body) = send(&app, "GET", &format!("/api/v1/polls/{lowercase}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionCode"], code.as_str());
    assert_eq!(body["totalVotes"], 0);
}

#[tokio::test]
async fn test_unknown_and_malformed_codes_are_not_found() {
    let app = app();

    for uri in ["/api/v1/polls/ZZZZZZ", "/api/v1/polls/not-a-code"] {
        let (status, body) = send(&app, "GET", uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(error_code(&body), "NOT_FOUND");
    }
}

// ============================================================================
// Voting
// ============================================================================

#[tokio::test]
async fn test_account_vote_and_error_mapping() {
    let app = app();
    let code = create_poll(&app, "owner").await;
    let vote_uri = format!("/api/v1/polls/{code}/vote");

    let (status, body) = send(
        &app,
        "POST",
        &vote_uri,
        Some("alice"),
        Some(json!({ "optionIndex": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tally"], json!([0, 1]));

    let (status, body) = send(
        &app,
        "POST",
        &vote_uri,
        Some("alice"),
        Some(json!({ "optionIndex": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), "DUPLICATE_VOTE");

    let (status, body) = send(
        &app,
        "POST",
        &vote_uri,
        Some("bob"),
        Some(json!({ "optionIndex": 9 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "INVALID_OPTION");

    let (status, body) = send(&app, "POST", &vote_uri, None, Some(json!({ "optionIndex": 0 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "NOT_AUTHORIZED");
}

#[tokio::test]
async fn test_anonymous_vote_with_voting_token() {
    let app = app();
    let code = create_poll(&app, "owner").await;
    let vote_uri = format!("/api/v1/polls/{code}/vote");

    let (status, token) = send(
        &app,
        "POST",
        &format!("/api/v1/polls/{code}/voting-token"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(token["tokenId"].is_string());

    let (status, body) = send(
        &app,
        "POST",
        &vote_uri,
        None,
        Some(json!({ "optionIndex": 0, "votingToken": token.clone() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalVotes"], 1);

    let (status, _) = send(
        &app,
        "POST",
        &vote_uri,
        None,
        Some(json!({ "optionIndex": 1, "votingToken": token.clone() })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let forged = json!({ "tokenId": token["tokenId"].clone(), "token": "00".repeat(32) });
    let (status, body) = send(
        &app,
        "POST",
        &vote_uri,
        None,
        Some(json!({ "optionIndex": 1, "votingToken": forged })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "INVALID_VOTING_TOKEN");
}

// ============================================================================
// Owner operations
// ============================================================================

#[tokio::test]
async fn test_end_poll_owner_only() {
    let app = app();
    let code = create_poll(&app, "owner").await;
    let end_uri = format!("/api/v1/polls/{code}/end");

    let (status, _) = send(&app, "POST", &end_uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, "POST", &end_uri, Some("owner"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ended");
    assert_eq!(body["endReason"], "owner");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/v1/polls/{code}/vote"),
        Some("alice"),
        Some(json!({ "optionIndex": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(error_code(&body), "POLL_ENDED");

    let (status, _) = send(&app, "GET", &format!("/api/v1/polls/{code}/current"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "GET", &format!("/api/v1/polls/{code}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ended");
}

#[tokio::test]
async fn test_delete_poll() {
    let app = app();
    let code = create_poll(&app, "owner").await;
    let uri = format!("/api/v1/polls/{code}");

    let (status, _) = send(&app, "DELETE", &uri, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, "DELETE", &uri, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, "DELETE", &uri, Some("owner"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _) = send(&app, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_my_polls_and_stats() {
    let app = app();
    let first = create_poll(&app, "owner").await;
    let second = create_poll(&app, "owner").await;
    create_poll(&app, "someone-else").await;

    send(
        &app,
        "POST",
        &format!("/api/v1/polls/{first}/vote"),
        Some("alice"),
        Some(json!({ "optionIndex": 0 })),
    )
    .await;

    let (status, body) = send(&app, "GET", "/api/v1/polls/mine", Some("owner"), None).await;
    assert_eq!(status, StatusCode::OK);
    let codes: Vec<&str> = body["polls"]
        .as_array()
        .unwrap()
        .iter()
        .map(|poll| poll["sessionCode"].as_str().unwrap())
        .collect();
    assert_eq!(codes.len(), 2);
    assert!(codes.contains(&first.as_str()));
    assert!(codes.contains(&second.as_str()));

    let (status, body) = send(&app, "GET", "/api/v1/polls/stats", Some("owner"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "totalPolls": 2, "totalVotes": 1, "activeVoters": 1 }));

    let (status, _) = send(&app, "GET", "/api/v1/polls/mine", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_public_listing_respects_visibility() {
    let app = app();
    let open = create_poll(&app, "owner").await;
    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/polls",
        Some("owner"),
        Some(json!({ "question": "Team lunch?", "options": ["Yes", "No"], "isPublic": false })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["poll"]["isPublic"], false);
    let hidden = body["sessionCode"].as_str().unwrap().to_string();

    let codes = |body: &Value| -> Vec<String> {
        body["polls"]
            .as_array()
            .unwrap()
            .iter()
            .map(|poll| poll["sessionCode"].as_str().unwrap().to_string())
            .collect()
    };

    // No identity needed to browse
    let (status, body) = send(&app, "GET", "/api/v1/polls", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(codes(&body), vec![open.clone()]);

    let (_, body) = send(&app, "GET", "/api/v1/polls", Some("stranger"), None).await;
    assert_eq!(codes(&body), vec![open.clone()]);

    let (_, body) = send(&app, "GET", "/api/v1/polls", Some("owner"), None).await;
    let listed = codes(&body);
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&open));
    assert!(listed.contains(&hidden));

    // Private polls stay reachable by code
    let (status, _) = send(&app, "GET", &format!("/api/v1/polls/{hidden}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Live stream
// ============================================================================

/// Read SSE frames until the accumulated text contains `needle`.
async fn read_until(body: &mut Body, buffer: &mut String, needle: &str) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !buffer.contains(needle) {
            let frame = body
                .frame()
                .await
                .expect("stream ended early")
                .expect("stream failed");
            if let Ok(data) = frame.into_data() {
                buffer.push_str(&String::from_utf8_lossy(&data));
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {needle:?} in {buffer:?}"));
}

#[tokio::test]
async fn test_live_stream_sends_snapshot_then_updates() {
    let app = app();
    let code = create_poll(&app, "owner").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/polls/{code}/live"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body();
    let mut buffer = String::new();
    read_until(&mut body, &mut buffer, "\"type\":\"snapshot\"").await;
    assert!(buffer.contains("\"totalVotes\":0"));

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/polls/{code}/vote"),
        Some("alice"),
        Some(json!({ "optionIndex": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    read_until(&mut body, &mut buffer, "\"totalVotes\":1").await;
}

#[tokio::test]
async fn test_live_stream_for_unknown_poll_is_not_found() {
    let app = app();
    let (status, _) = send(&app, "GET", "/api/v1/polls/ZZZZZZ/live", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_closing_the_stream_releases_the_subscription() {
    let service = ephemeral_service();
    let app = build_routes(Arc::new(AppState {
        service: service.clone(),
    }));
    let code = create_poll(&app, "owner").await;
    let parsed = common::types::SessionCode::parse(&code).unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/polls/{code}/live"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(service.subscriber_count(&parsed).await, 1);

    drop(response);

    tokio::time::timeout(EVENT_TIMEOUT, async {
        while service.subscriber_count(&parsed).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription should be released");
}
