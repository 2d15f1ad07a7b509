//! Durable poll storage.
//!
//! The service runs with or without a [`PollStore`]. Without one, polls are
//! ephemeral and vanish when retired. With one, every committed mutation is
//! written through before it becomes visible, and retired polls are reloaded
//! on the next access.
//!
//! # Components
//!
//! - [`PollStore`] - async storage trait used by the registry and poll actors
//! - [`RedisPollStore`] - Redis implementation with Lua-backed atomic writes

mod lua_scripts;
mod redis;

pub use self::redis::RedisPollStore;

use crate::errors::PollError;
use crate::ledger::{EndReason, PollStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{SessionCode, VoterIdentity};
use serde::{Deserialize, Serialize};

/// One recorded vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterRecord {
    pub identity: VoterIdentity,
    pub voted_at: DateTime<Utc>,
}

/// Stored form of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    pub session_code: SessionCode,
    pub question: String,
    pub options: Vec<String>,
    pub tally: Vec<u64>,
    pub voters: Vec<VoterRecord>,
    pub status: PollStatus,
    pub end_reason: Option<EndReason>,
    pub created_by: VoterIdentity,
    pub created_at: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub version: u64,
}

fn default_public() -> bool {
    true
}

/// Outcome of [`PollStore::delete_by_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    NotOwner,
}

/// Durable storage for polls.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Insert or replace a poll and index it under its owner.
    async fn save(&self, record: &PollRecord) -> Result<(), PollError>;

    /// Load a poll by code.
    async fn load(&self, code: &SessionCode) -> Result<Option<PollRecord>, PollError>;

    /// Delete a poll if `owner` created it.
    async fn delete_by_owner(
        &self,
        code: &SessionCode,
        owner: &VoterIdentity,
    ) -> Result<DeleteOutcome, PollError>;

    /// All polls created by `owner`.
    async fn list_by_owner(&self, owner: &VoterIdentity) -> Result<Vec<PollRecord>, PollError>;

    /// All polls marked public.
    async fn list_public(&self) -> Result<Vec<PollRecord>, PollError>;
}
