//! Poll handlers.
//!
//! Implements the poll endpoints:
//!
//! - `POST /api/v1/polls` - Create poll (identity required)
//! - `GET /api/v1/polls` - Public polls plus the caller's own, newest first
//! - `GET /api/v1/polls/mine` - Caller's polls, newest first (identity required)
//! - `GET /api/v1/polls/stats` - Caller's totals (identity required)
//! - `GET /api/v1/polls/{code}` - Poll state, active or ended
//! - `GET /api/v1/polls/{code}/current` - Poll state, active only
//! - `POST /api/v1/polls/{code}/vote` - Vote as account or with a voting token
//! - `POST /api/v1/polls/{code}/voting-token` - Issue an anonymous voting token
//! - `POST /api/v1/polls/{code}/end` - End poll (owner only)
//! - `DELETE /api/v1/polls/{code}` - Delete poll (owner only)
//! - `GET /api/v1/polls/{code}/live` - Server-Sent Events stream of poll events
//!
//! # Security
//!
//! - Identities come from the upstream-authenticated header only
//! - Anonymous votes must carry a voting token minted for that poll
//! - A malformed session code is reported as not found

use crate::actors::PollEvent;
use crate::errors::PollError;
use crate::ledger::PollSnapshot;
use crate::middleware::identity_from_headers;
use crate::models::{CreatePollRequest, CreatePollResponse, PollListResponse, VoteRequest};
use crate::routes::AppState;
use crate::service::OwnerStats;
use crate::voting_token::VotingToken;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use common::types::{ConnectionId, SessionCode, VoterIdentity};
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument};

fn parse_code(raw: &str) -> Result<SessionCode, PollError> {
    SessionCode::parse(raw).map_err(|e| {
        tracing::debug!(target: "poll.handlers.polls", error = %e, "Malformed session code");
        PollError::NotFound(raw.to_string())
    })
}

/// Deserialize a JSON body, reporting failures as 400 rather than axum's 422.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, PollError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "poll.handlers.polls", error = %e, "Invalid request body");
        PollError::Validation("Invalid request body".to_string())
    })
}

// ============================================================================
// Handler: POST /api/v1/polls
// ============================================================================

/// Handler for POST /api/v1/polls
///
/// # Response
///
/// - 201 Created: poll is live, body carries its code and first snapshot
/// - 400 Bad Request: invalid body, question or options
/// - 403 Forbidden: missing identity
/// - 503 Service Unavailable: at capacity, draining or storage down
#[instrument(skip_all, name = "poll.api.create")]
pub async fn create_poll(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VoterIdentity>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreatePollResponse>), PollError> {
    let request: CreatePollRequest = parse_body(&body)?;
    let poll = state
        .service
        .create_poll(request.into_draft(identity))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePollResponse {
            session_code: poll.session_code.to_string(),
            poll,
        }),
    ))
}

/// Handler for GET /api/v1/polls
///
/// Anyone may browse public polls. With an identity, the caller's private
/// polls are listed as well.
#[instrument(skip_all, name = "poll.api.list")]
pub async fn list_polls(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PollListResponse>, PollError> {
    let viewer = identity_from_headers(&headers)?;
    let polls = state.service.list_visible_polls(viewer.as_ref()).await?;
    Ok(Json(PollListResponse { polls }))
}

/// Handler for GET /api/v1/polls/mine
#[instrument(skip_all, name = "poll.api.list_mine")]
pub async fn list_my_polls(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VoterIdentity>,
) -> Result<Json<PollListResponse>, PollError> {
    let polls = state.service.list_polls_for_owner(&identity).await?;
    Ok(Json(PollListResponse { polls }))
}

/// Handler for GET /api/v1/polls/stats
#[instrument(skip_all, name = "poll.api.stats")]
pub async fn my_stats(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VoterIdentity>,
) -> Result<Json<OwnerStats>, PollError> {
    Ok(Json(state.service.get_stats_for_owner(&identity).await?))
}

// ============================================================================
// Handlers: /api/v1/polls/{code}
// ============================================================================

/// Handler for GET /api/v1/polls/{code}
#[instrument(skip_all, name = "poll.api.get", fields(session_code = %code))]
pub async fn get_poll(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<Arc<PollSnapshot>>, PollError> {
    let code = parse_code(&code)?;
    Ok(Json(state.service.get_poll(&code).await?))
}

/// Handler for GET /api/v1/polls/{code}/current
///
/// Like [`get_poll`] but an ended poll is reported as not found, which is
/// what a participant joining by code should see.
#[instrument(skip_all, name = "poll.api.current", fields(session_code = %code))]
pub async fn get_current(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<Arc<PollSnapshot>>, PollError> {
    let code = parse_code(&code)?;
    Ok(Json(state.service.get_current(&code).await?))
}

/// Handler for POST /api/v1/polls/{code}/vote
///
/// A body with `votingToken` votes anonymously. Otherwise the identity
/// header is required.
///
/// # Response
///
/// - 200 OK: vote recorded, body is the resulting snapshot
/// - 403 Forbidden: no identity, or a token not issued for this poll
/// - 404 Not Found, 409 Conflict (already voted), 410 Gone (ended),
///   422 Unprocessable Entity (option out of range)
#[instrument(skip_all, name = "poll.api.vote", fields(session_code = %code))]
pub async fn vote(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Arc<PollSnapshot>>, PollError> {
    let code = parse_code(&code)?;
    let request: VoteRequest = parse_body(&body)?;

    let snapshot = match request.voting_token {
        Some(token) => {
            state
                .service
                .vote_anonymous(&code, request.option_index, &token)
                .await?
        }
        None => {
            let identity = identity_from_headers(&headers)?.ok_or_else(|| {
                PollError::NotAuthorized("Sign in or use a voting token".to_string())
            })?;
            state
                .service
                .vote(&code, request.option_index, identity)
                .await?
        }
    };

    Ok(Json(snapshot))
}

/// Handler for POST /api/v1/polls/{code}/voting-token
///
/// Each call mints a fresh token; the one-vote rule holds per token.
#[instrument(skip_all, name = "poll.api.voting_token", fields(session_code = %code))]
pub async fn issue_voting_token(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<(StatusCode, Json<VotingToken>), PollError> {
    let code = parse_code(&code)?;
    let token = state.service.issue_voting_token(&code).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

/// Handler for POST /api/v1/polls/{code}/end
#[instrument(skip_all, name = "poll.api.end", fields(session_code = %code))]
pub async fn end_poll(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VoterIdentity>,
    Path(code): Path<String>,
) -> Result<Json<Arc<PollSnapshot>>, PollError> {
    let code = parse_code(&code)?;
    Ok(Json(state.service.end_poll(&code, identity).await?))
}

/// Handler for DELETE /api/v1/polls/{code}
#[instrument(skip_all, name = "poll.api.delete", fields(session_code = %code))]
pub async fn delete_poll(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VoterIdentity>,
    Path(code): Path<String>,
) -> Result<StatusCode, PollError> {
    let code = parse_code(&code)?;
    state.service.delete_poll(&code, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Handler: GET /api/v1/polls/{code}/live
// ============================================================================

/// Handler for GET /api/v1/polls/{code}/live
///
/// Each request is one live connection. The first event is the current
/// snapshot, followed by `snapshot`, `participants` and finally `closed`
/// events. When the client goes away the stream is dropped, which closes
/// the event queue and the hub reaps the subscription.
#[instrument(skip_all, name = "poll.api.live", fields(session_code = %code))]
pub async fn live_updates(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, PollError> {
    let code = parse_code(&code)?;
    let connection_id = ConnectionId::new();

    let (sink, events) = mpsc::channel(state.service.subscriber_buffer());
    let initial = state
        .service
        .subscribe(&connection_id, &code, sink)
        .await?;

    info!(
        target: "poll.handlers.polls",
        session_code = %code,
        connection_id = %connection_id,
        version = initial.version,
        "Live connection opened"
    );

    let stream = stream::iter([PollEvent::Snapshot { poll: initial }])
        .chain(ReceiverStream::new(events))
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
