//! Redis-backed poll storage.
//!
//! # Key Patterns
//!
//! - `poll:{code}` - Poll document (JSON)
//! - `poll:{code}:owner` - Owner storage key
//! - `poll:{code}:version` - Last written snapshot version
//! - `owner:{owner}:polls` - Session codes created by an owner (SET)
//! - `polls:public` - Session codes of public polls (SET)
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking.

use super::lua_scripts;
use super::{DeleteOutcome, PollRecord, PollStore};
use crate::errors::PollError;
use crate::observability::metrics;
use async_trait::async_trait;
use common::types::{SessionCode, VoterIdentity};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

fn poll_key(code: &SessionCode) -> String {
    format!("poll:{code}")
}

fn owner_key(code: &SessionCode) -> String {
    format!("poll:{code}:owner")
}

fn version_key(code: &SessionCode) -> String {
    format!("poll:{code}:version")
}

fn owner_index_key(owner: &VoterIdentity) -> String {
    format!("owner:{}:polls", owner.storage_key())
}

const PUBLIC_INDEX_KEY: &str = "polls:public";

/// Redis implementation of [`PollStore`].
#[derive(Clone)]
pub struct RedisPollStore {
    connection: MultiplexedConnection,
    save_script: Script,
    delete_script: Script,
}

impl RedisPollStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Storage` if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, PollError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may carry credentials
            error!(
                target: "poll.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            PollError::Storage(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "poll.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                PollError::Storage(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            save_script: Script::new(lua_scripts::SAVE_POLL),
            delete_script: Script::new(lua_scripts::DELETE_POLL),
        })
    }

    /// Round-trip a PING, used by readiness checks.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Storage` if Redis does not answer.
    pub async fn ping(&self) -> Result<(), PollError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PollError::Storage(format!("PING failed: {e}")))?;
        Ok(())
    }
}

fn observe<T>(operation: &str, started: Instant, result: &Result<T, PollError>) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_operation(operation, status, started.elapsed());
}

#[async_trait]
impl PollStore for RedisPollStore {
    #[instrument(skip_all, fields(session_code = %record.session_code, version = record.version))]
    async fn save(&self, record: &PollRecord) -> Result<(), PollError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();
        let code = &record.session_code;

        let result: Result<(), PollError> = async {
            let document = serde_json::to_string(record)
                .map_err(|e| PollError::Internal(format!("Failed to serialize poll: {e}")))?;

            let outcome: i64 = self
                .save_script
                .key(poll_key(code))
                .key(owner_key(code))
                .key(version_key(code))
                .key(owner_index_key(&record.created_by))
                .key(PUBLIC_INDEX_KEY)
                .arg(record.version)
                .arg(document)
                .arg(record.created_by.storage_key())
                .arg(code.as_str())
                .arg(if record.is_public { "1" } else { "0" })
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(
                        target: "poll.store.redis",
                        error = %e,
                        session_code = %code,
                        "Failed to save poll"
                    );
                    PollError::Storage(format!("Failed to save poll: {e}"))
                })?;

            match outcome {
                1 => Ok(()),
                0 => {
                    warn!(
                        target: "poll.store.redis",
                        session_code = %code,
                        version = record.version,
                        "Rejected save of stale poll version"
                    );
                    Err(PollError::Storage("stale poll version".to_string()))
                }
                _ => Err(PollError::Storage(
                    "stored version is not a number".to_string(),
                )),
            }
        }
        .await;

        observe("save", started, &result);
        if result.is_ok() {
            debug!(
                target: "poll.store.redis",
                session_code = %code,
                version = record.version,
                "Saved poll"
            );
        }
        result
    }

    #[instrument(skip_all, fields(session_code = %code))]
    async fn load(&self, code: &SessionCode) -> Result<Option<PollRecord>, PollError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result: Result<Option<PollRecord>, PollError> = async {
            let document: Option<String> = conn.get(poll_key(code)).await.map_err(|e| {
                warn!(
                    target: "poll.store.redis",
                    error = %e,
                    session_code = %code,
                    "Failed to load poll"
                );
                PollError::Storage(format!("Failed to load poll: {e}"))
            })?;

            document
                .map(|json| {
                    serde_json::from_str::<PollRecord>(&json).map_err(|e| {
                        error!(
                            target: "poll.store.redis",
                            error = %e,
                            session_code = %code,
                            "Stored poll does not parse"
                        );
                        PollError::Storage(format!("Stored poll does not parse: {e}"))
                    })
                })
                .transpose()
        }
        .await;

        observe("load", started, &result);
        result
    }

    #[instrument(skip_all, fields(session_code = %code))]
    async fn delete_by_owner(
        &self,
        code: &SessionCode,
        owner: &VoterIdentity,
    ) -> Result<DeleteOutcome, PollError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result: Result<DeleteOutcome, PollError> = async {
            let outcome: i64 = self
                .delete_script
                .key(poll_key(code))
                .key(owner_key(code))
                .key(version_key(code))
                .key(owner_index_key(owner))
                .key(PUBLIC_INDEX_KEY)
                .arg(owner.storage_key())
                .arg(code.as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(
                        target: "poll.store.redis",
                        error = %e,
                        session_code = %code,
                        "Failed to delete poll"
                    );
                    PollError::Storage(format!("Failed to delete poll: {e}"))
                })?;

            Ok(match outcome {
                1 => DeleteOutcome::Deleted,
                -1 => DeleteOutcome::NotOwner,
                _ => DeleteOutcome::NotFound,
            })
        }
        .await;

        observe("delete", started, &result);
        result
    }

    #[instrument(skip_all)]
    async fn list_by_owner(&self, owner: &VoterIdentity) -> Result<Vec<PollRecord>, PollError> {
        let started = Instant::now();
        let result = self.load_indexed(&owner_index_key(owner)).await;
        observe("list", started, &result);
        result
    }

    #[instrument(skip_all)]
    async fn list_public(&self) -> Result<Vec<PollRecord>, PollError> {
        let started = Instant::now();
        let result = self.load_indexed(PUBLIC_INDEX_KEY).await;
        observe("list_public", started, &result);
        result
    }
}

impl RedisPollStore {
    /// Load every poll whose code is a member of the set at `index_key`.
    ///
    /// Codes whose document is gone or does not parse are skipped.
    async fn load_indexed(&self, index_key: &str) -> Result<Vec<PollRecord>, PollError> {
        let mut conn = self.connection.clone();

        let codes: Vec<String> = conn.smembers(index_key).await.map_err(|e| {
            warn!(
                target: "poll.store.redis",
                error = %e,
                index = index_key,
                "Failed to read poll index"
            );
            PollError::Storage(format!("Failed to read poll index: {e}"))
        })?;

        let codes: Vec<SessionCode> = codes
            .iter()
            .filter_map(|raw| SessionCode::parse(raw).ok())
            .collect();
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = codes.iter().map(poll_key).collect();
        let documents: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| PollError::Storage(format!("Failed to load indexed polls: {e}")))?;

        let mut records = Vec::with_capacity(documents.len());
        for (code, document) in codes.iter().zip(documents) {
            let Some(json) = document else {
                continue;
            };
            match serde_json::from_str::<PollRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    target: "poll.store.redis",
                    error = %e,
                    session_code = %code,
                    "Skipping stored poll that does not parse"
                ),
            }
        }
        Ok(records)
    }
}
