//! `PollRegistry` - the live poll set, keyed by session code.
//!
//! The registry owns one [`PollActor`] per live poll:
//!
//! - Allocates a unique session code and spawns the poll's actor on create
//! - Resolves codes to actor handles, reloading durable polls on a miss
//! - Retires polls (cancels the actor, closes the hub room)
//! - Monitors actor health (panic detection via `JoinHandle`)
//!
//! # Code allocation
//!
//! A candidate is rejected if it is live, reserved by a creation in flight,
//! still retiring, or present in the store. Accepted candidates are reserved
//! under the write lock, persisted without holding it, and only then made
//! visible.
//!
//! # Retirement
//!
//! A retiring code stays in the table until its actor has exited, so a write
//! the actor already started lands before the poll can be reloaded from the
//! store. [`PollRegistry::resolve`] waits for that instead of starting a
//! second actor over a stale record.
//!
//! # Graceful Shutdown
//!
//! [`PollRegistry::shutdown`]:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the registry's `CancellationToken` (propagates to all poll actors)
//! 3. Waits for poll actors to exit, bounded by a deadline
//! 4. Closes every hub room

use crate::actors::messages::CloseReason;
use crate::actors::metrics::{ActorMetrics, ActorType};
use crate::actors::poll::{PollActor, PollActorHandle};
use crate::code::{SessionCodeGenerator, MAX_CODE_ATTEMPTS};
use crate::config::Config;
use crate::errors::PollError;
use crate::hub::SubscriptionHub;
use crate::ledger::{PollDraft, PollSnapshot, VoteLedger};
use crate::observability::metrics;
use crate::storage::PollStore;

use chrono::Utc;
use common::types::SessionCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long a retired poll actor gets to exit before we stop waiting.
const RETIRE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub instance_id: String,
    pub max_active_polls: usize,
    pub operation_timeout: Duration,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            max_active_polls: config.max_active_polls,
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Why a poll left memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Ephemeral poll lost its last subscriber.
    Abandoned,
    /// Ephemeral poll sat unwatched past the idle timeout.
    Idle,
    /// Ended durable poll dropped from memory; still in the store.
    Evicted,
    /// Ended ephemeral poll cleaned up by the sweep.
    Ended,
    /// Owner deleted the poll.
    Deleted,
}

impl RetireReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Abandoned => "abandoned",
            RetireReason::Idle => "idle",
            RetireReason::Evicted => "evicted",
            RetireReason::Ended => "ended",
            RetireReason::Deleted => "deleted",
        }
    }
}

/// Point-in-time registry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub live_polls: usize,
    pub subscribers: usize,
    pub is_draining: bool,
    pub is_durable: bool,
}

/// Internal state for a managed poll.
struct ManagedPoll {
    handle: PollActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

#[derive(Default)]
struct PollTable {
    live: HashMap<SessionCode, ManagedPoll>,
    /// Codes handed to a creation that has not finished persisting.
    reserved: HashSet<SessionCode>,
    /// Codes whose actor is stopping; the token fires once it has exited.
    retiring: HashMap<SessionCode, CancellationToken>,
}

impl PollTable {
    fn occupied(&self) -> usize {
        self.live.len() + self.reserved.len()
    }

    fn is_taken(&self, code: &SessionCode) -> bool {
        self.live.contains_key(code)
            || self.reserved.contains(code)
            || self.retiring.contains_key(code)
    }
}

struct RegistryInner {
    settings: RegistrySettings,
    table: RwLock<PollTable>,
    codes: SessionCodeGenerator,
    store: Option<Arc<dyn PollStore>>,
    hub: SubscriptionHub,
    /// Parent of every poll actor's token.
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    accepting_new: AtomicBool,
}

/// The live poll set.
///
/// Cheap to clone; all clones share the same polls.
#[derive(Clone)]
pub struct PollRegistry {
    inner: Arc<RegistryInner>,
}

impl PollRegistry {
    #[must_use]
    pub fn new(
        settings: RegistrySettings,
        codes: SessionCodeGenerator,
        store: Option<Arc<dyn PollStore>>,
        hub: SubscriptionHub,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                table: RwLock::new(PollTable::default()),
                codes,
                store,
                hub,
                cancel_token,
                metrics,
                accepting_new: AtomicBool::new(true),
            }),
        }
    }

    /// Whether polls are written through to durable storage.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.inner.store.is_some()
    }

    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn PollStore>> {
        self.inner.store.as_ref()
    }

    /// Create a poll under a fresh session code.
    ///
    /// # Errors
    ///
    /// - `Draining` during shutdown
    /// - `Validation` if the draft is malformed
    /// - `CapacityExceeded` if the live poll limit is reached
    /// - `Internal` if no unique code was found in [`MAX_CODE_ATTEMPTS`] tries
    /// - `Storage` if the new poll could not be persisted
    #[instrument(skip_all, name = "poll.registry.create")]
    pub async fn create_poll(&self, draft: PollDraft) -> Result<Arc<PollSnapshot>, PollError> {
        if !self.is_accepting() {
            return Err(PollError::Draining);
        }

        let now = Utc::now();
        let draft = draft.validate(now)?;
        let code = self.reserve_code().await?;

        let ledger = VoteLedger::new(code.clone(), draft, now);
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save(&ledger.to_record()).await {
                self.inner.table.write().await.reserved.remove(&code);
                warn!(
                    target: "poll.registry",
                    session_code = %code,
                    error = %e,
                    "Failed to persist new poll"
                );
                return Err(e);
            }
        }

        let snapshot = Arc::new(ledger.snapshot());
        {
            let mut table = self.inner.table.write().await;
            table.reserved.remove(&code);
            self.activate(&mut table, ledger).await;
        }

        metrics::record_poll_created();
        info!(
            target: "poll.registry",
            instance_id = %self.inner.settings.instance_id,
            session_code = %code,
            options = snapshot.options.len(),
            durable = self.is_durable(),
            "Poll created"
        );

        Ok(snapshot)
    }

    /// Pick a code that is not live, reserved or stored, and reserve it.
    async fn reserve_code(&self) -> Result<SessionCode, PollError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let candidate = self.inner.codes.generate()?;

            let stored = match &self.inner.store {
                Some(store) => store.load(&candidate).await?.is_some(),
                None => false,
            };

            {
                let mut table = self.inner.table.write().await;
                if table.occupied() >= self.inner.settings.max_active_polls {
                    return Err(PollError::CapacityExceeded);
                }
                if !stored && !table.is_taken(&candidate) {
                    table.reserved.insert(candidate.clone());
                    return Ok(candidate);
                }
            }

            metrics::record_code_collision();
            debug!(
                target: "poll.registry",
                attempt,
                "Session code collision, retrying"
            );
        }

        error!(
            target: "poll.registry",
            attempts = MAX_CODE_ATTEMPTS,
            "Could not allocate a unique session code"
        );
        Err(PollError::Internal(
            "could not allocate a unique session code".to_string(),
        ))
    }

    /// Spawn the actor for `ledger` and make it visible. Caller holds the write lock.
    async fn activate(&self, table: &mut PollTable, ledger: VoteLedger) -> PollActorHandle {
        let code = ledger.session_code().clone();
        self.inner
            .hub
            .open_room(&code, Arc::new(ledger.snapshot()))
            .await;

        let (handle, task_handle) = PollActor::spawn(
            ledger,
            self.inner.store.clone(),
            self.inner.hub.clone(),
            self.inner.cancel_token.child_token(),
            Arc::clone(&self.inner.metrics),
            self.inner.settings.operation_timeout,
        );

        table.live.insert(
            code,
            ManagedPoll {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.inner.metrics.poll_started();
        handle
    }

    /// Handle of a poll that is live in memory.
    pub async fn get(&self, code: &SessionCode) -> Option<PollActorHandle> {
        self.inner
            .table
            .read()
            .await
            .live
            .get(code)
            .map(|managed| managed.handle.clone())
    }

    /// Handle of a poll, reloading it from the store if it is not in memory.
    ///
    /// If the poll is retiring, waits for its actor to exit first.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no live or stored poll has this code
    /// - `Storage` if the stored poll cannot be read
    /// - `Draining` / `CapacityExceeded` if a stored poll cannot be reloaded now
    pub async fn resolve(&self, code: &SessionCode) -> Result<PollActorHandle, PollError> {
        loop {
            let retiring = {
                let table = self.inner.table.read().await;
                if let Some(managed) = table.live.get(code) {
                    return Ok(managed.handle.clone());
                }
                table.retiring.get(code).cloned()
            };
            if let Some(exited) = retiring {
                exited.cancelled().await;
                continue;
            }

            let Some(store) = &self.inner.store else {
                return Err(PollError::NotFound(code.to_string()));
            };
            let record = store
                .load(code)
                .await?
                .ok_or_else(|| PollError::NotFound(code.to_string()))?;
            let ledger = VoteLedger::from_record(record)?;

            let mut table = self.inner.table.write().await;
            if let Some(existing) = table.live.get(code) {
                return Ok(existing.handle.clone());
            }
            // Retired again while we were loading; the record may be stale
            if table.retiring.contains_key(code) {
                continue;
            }
            if table.reserved.contains(code) {
                return Err(PollError::NotFound(code.to_string()));
            }
            if !self.is_accepting() {
                return Err(PollError::Draining);
            }
            if table.occupied() >= self.inner.settings.max_active_polls {
                return Err(PollError::CapacityExceeded);
            }

            let handle = self.activate(&mut table, ledger).await;
            drop(table);

            info!(
                target: "poll.registry",
                session_code = %code,
                "Poll reloaded from storage"
            );
            return Ok(handle);
        }
    }

    /// Handles of every live poll.
    pub async fn live_polls(&self) -> Vec<PollActorHandle> {
        self.inner
            .table
            .read()
            .await
            .live
            .values()
            .map(|managed| managed.handle.clone())
            .collect()
    }

    /// Remove a poll from memory and close its room.
    ///
    /// Waits (bounded) for the actor to finish the message it is handling, so
    /// a write already under way reaches the store before the code can be
    /// resolved again. Stored data is left untouched. Returns `false` if the
    /// poll was not live.
    pub async fn retire(&self, code: &SessionCode, reason: RetireReason) -> bool {
        let exited = CancellationToken::new();
        let managed = {
            let mut table = self.inner.table.write().await;
            let Some(managed) = table.live.remove(code) else {
                return false;
            };
            table.retiring.insert(code.clone(), exited.clone());
            managed
        };

        managed.handle.cancel();

        // Finish on a task of its own so a dropped caller cannot strand the code as retiring
        let inner = Arc::clone(&self.inner);
        let retiring_code = code.clone();
        let cleanup = tokio::spawn(async move {
            let code = retiring_code;
            match tokio::time::timeout(RETIRE_JOIN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "poll.registry",
                        session_code = %code,
                        "Poll actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "poll.registry",
                        session_code = %code,
                        error = ?e,
                        "Poll actor task panicked during retirement"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "poll.registry",
                        session_code = %code,
                        "Poll actor task cleanup timed out"
                    );
                }
            }

            // The room must be gone before a reload opens a fresh one
            inner.hub.close_room(&code, CloseReason::Retired).await;
            inner.table.write().await.retiring.remove(&code);
            exited.cancel();
        });
        if let Err(e) = cleanup.await {
            warn!(
                target: "poll.registry",
                session_code = %code,
                error = ?e,
                "Poll retirement cleanup failed"
            );
        }

        self.inner.metrics.poll_retired();
        metrics::record_poll_retired(reason.as_str());

        info!(
            target: "poll.registry",
            session_code = %code,
            reason = reason.as_str(),
            "Poll retired"
        );
        true
    }

    /// Drop polls whose actor task stopped without being retired.
    ///
    /// Returns the number of polls removed.
    pub async fn check_poll_health(&self) -> usize {
        let finished: Vec<(SessionCode, ManagedPoll)> = {
            let mut table = self.inner.table.write().await;
            let codes: Vec<SessionCode> = table
                .live
                .iter()
                .filter(|(_, managed)| managed.task_handle.is_finished())
                .map(|(code, _)| code.clone())
                .collect();
            codes
                .into_iter()
                .filter_map(|code| table.live.remove(&code).map(|managed| (code, managed)))
                .collect()
        };

        let removed = finished.len();
        for (code, managed) in finished {
            match managed.task_handle.await {
                Ok(()) => {
                    warn!(
                        target: "poll.registry",
                        session_code = %code,
                        "Poll actor exited without being retired"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "poll.registry",
                            session_code = %code,
                            error = ?join_error,
                            "Poll actor panicked - triggering investigation"
                        );
                        self.inner.metrics.record_panic(ActorType::Poll);
                    }
                }
            }

            self.inner.hub.close_room(&code, CloseReason::Retired).await;
            self.inner.metrics.poll_retired();
            metrics::record_poll_retired("failed");
        }
        removed
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting_new.load(Ordering::SeqCst)
    }

    /// Current registry status.
    pub async fn status(&self) -> RegistryStatus {
        RegistryStatus {
            live_polls: self.inner.table.read().await.live.len(),
            subscribers: self.inner.metrics.subscriber_count(),
            is_draining: !self.is_accepting(),
            is_durable: self.is_durable(),
        }
    }

    /// Stop accepting polls, stop every poll actor and close every room.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.accepting_new.store(false, Ordering::SeqCst);

        let polls: Vec<(SessionCode, ManagedPoll)> =
            self.inner.table.write().await.live.drain().collect();

        info!(
            target: "poll.registry",
            instance_id = %self.inner.settings.instance_id,
            poll_count = polls.len(),
            "Performing graceful shutdown"
        );

        // Cancel the parent token (propagates to all poll actors)
        self.inner.cancel_token.cancel();

        let wait_all = async {
            for (code, managed) in polls {
                match managed.task_handle.await {
                    Ok(()) => {
                        debug!(
                            target: "poll.registry",
                            session_code = %code,
                            "Poll actor completed cleanly"
                        );
                    }
                    Err(e) => {
                        warn!(
                            target: "poll.registry",
                            session_code = %code,
                            error = ?e,
                            "Poll actor task panicked during shutdown"
                        );
                    }
                }
                self.inner.metrics.poll_retired();
            }
        };

        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            warn!(
                target: "poll.registry",
                "Poll actor shutdown timed out"
            );
        }

        self.inner.hub.close_all(CloseReason::ShuttingDown).await;

        info!(
            target: "poll.registry",
            instance_id = %self.inner.settings.instance_id,
            "Graceful shutdown complete"
        );
    }
}
