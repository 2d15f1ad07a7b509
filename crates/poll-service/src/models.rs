//! Request and response bodies for the HTTP API.

use crate::ledger::{PollDraft, PollSnapshot};
use crate::voting_token::VotingToken;
use chrono::{DateTime, Utc};
use common::types::VoterIdentity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /api/v1/polls`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default = "default_public")]
    pub is_public: bool,
}

fn default_public() -> bool {
    true
}

impl CreatePollRequest {
    /// Turn the request into a draft owned by `created_by`.
    ///
    /// Validation happens in the registry, not here.
    #[must_use]
    pub fn into_draft(self, created_by: VoterIdentity) -> PollDraft {
        let draft =
            PollDraft::new(self.question, self.options, created_by).with_visibility(self.is_public);
        match self.end_date {
            Some(end_date) => draft.with_end_date(end_date),
            None => draft,
        }
    }
}

/// Body of `POST /api/v1/polls/:code/vote`.
///
/// Account voters send only `optionIndex` and are identified by the
/// identity header. Anonymous voters add the token they were issued.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_index: usize,
    #[serde(default)]
    pub voting_token: Option<VotingToken>,
}

/// Response of `POST /api/v1/polls`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollResponse {
    pub session_code: String,
    pub poll: Arc<PollSnapshot>,
}

/// Response of `GET /api/v1/polls` and `GET /api/v1/polls/mine`.
#[derive(Debug, Clone, Serialize)]
pub struct PollListResponse {
    pub polls: Vec<Arc<PollSnapshot>>,
}
