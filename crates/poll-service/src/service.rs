//! `PollService` - the entry point the calling layer talks to.
//!
//! One instance per process. It wires the [`PollRegistry`],
//! [`SubscriptionHub`] and [`PollLifecycle`] together under a root
//! `CancellationToken` and exposes every poll operation as an async method.
//!
//! Identity is an input. The service never authenticates anyone; it only
//! compares the identity it is handed with the one a poll was created by.

use crate::actors::messages::{EndTrigger, PollEvent};
use crate::actors::metrics::ActorMetrics;
use crate::actors::poll::PollActorHandle;
use crate::code::SessionCodeGenerator;
use crate::config::{
    Config, DEFAULT_EPHEMERAL_IDLE_TIMEOUT_SECONDS, DEFAULT_LIFECYCLE_SWEEP_INTERVAL_SECONDS,
    DEFAULT_MAX_ACTIVE_POLLS, DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_SUBSCRIBER_BUFFER,
};
use crate::errors::PollError;
use crate::hub::SubscriptionHub;
use crate::ledger::{PollDraft, PollSnapshot, PollStatus, VoteLedger};
use crate::lifecycle::{LifecycleSettings, PollLifecycle, SweepReport};
use crate::registry::{PollRegistry, RegistrySettings, RegistryStatus, RetireReason};
use crate::storage::{DeleteOutcome, PollRecord, PollStore};
use crate::voting_token::{VotingToken, VotingTokenIssuer};

use chrono::{DateTime, Utc};
use common::secret::SecretBox;
use common::types::{ConnectionId, SessionCode, VoterIdentity};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Service tuning, usually built from [`Config`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub registry: RegistrySettings,
    pub lifecycle: LifecycleSettings,
    /// Capacity of each live connection's event queue.
    pub subscriber_buffer: usize,
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            registry: RegistrySettings::from_config(config),
            lifecycle: LifecycleSettings::from_config(config),
            subscriber_buffer: config.subscriber_buffer,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings {
                instance_id: "poll-local".to_string(),
                max_active_polls: DEFAULT_MAX_ACTIVE_POLLS,
                operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            },
            lifecycle: LifecycleSettings {
                sweep_interval: Duration::from_secs(DEFAULT_LIFECYCLE_SWEEP_INTERVAL_SECONDS),
                idle_timeout: Duration::from_secs(DEFAULT_EPHEMERAL_IDLE_TIMEOUT_SECONDS),
            },
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Aggregate numbers over one owner's polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStats {
    pub total_polls: usize,
    pub total_votes: u64,
    /// Polls that received at least one vote.
    pub active_voters: usize,
}

/// Builder for [`PollService`].
pub struct PollServiceBuilder {
    voting_secret: SecretBox<Vec<u8>>,
    settings: ServiceSettings,
    store: Option<Arc<dyn PollStore>>,
    codes: Option<SessionCodeGenerator>,
}

impl PollServiceBuilder {
    #[must_use]
    pub fn settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Write polls through to `store` and reload them from it.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PollStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn code_generator(mut self, codes: SessionCodeGenerator) -> Self {
        self.codes = Some(codes);
        self
    }

    /// Start the service. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PollError::Config` if the voting secret is too short.
    pub fn build(self) -> Result<PollService, PollError> {
        let tokens = VotingTokenIssuer::new(self.voting_secret)?;

        let cancel_token = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (hub, hub_events) = SubscriptionHub::new(cancel_token.child_token(), Arc::clone(&metrics));

        let registry = PollRegistry::new(
            self.settings.registry.clone(),
            self.codes.unwrap_or_default(),
            self.store,
            hub.clone(),
            cancel_token.child_token(),
            Arc::clone(&metrics),
        );

        let lifecycle = PollLifecycle::new(
            registry.clone(),
            hub.clone(),
            self.settings.lifecycle.clone(),
        );
        let lifecycle_task = lifecycle
            .clone()
            .spawn(hub_events, cancel_token.child_token());

        info!(
            target: "poll.service",
            instance_id = %self.settings.registry.instance_id,
            durable = registry.is_durable(),
            max_active_polls = self.settings.registry.max_active_polls,
            "Poll service started"
        );

        Ok(PollService {
            inner: Arc::new(ServiceInner {
                registry,
                hub,
                lifecycle,
                tokens,
                metrics,
                cancel_token,
                lifecycle_task: Mutex::new(Some(lifecycle_task)),
                subscriber_buffer: self.settings.subscriber_buffer.max(1),
            }),
        })
    }
}

struct ServiceInner {
    registry: PollRegistry,
    hub: SubscriptionHub,
    lifecycle: PollLifecycle,
    tokens: VotingTokenIssuer,
    metrics: Arc<ActorMetrics>,
    /// Root token; every background task holds a child.
    cancel_token: CancellationToken,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
    subscriber_buffer: usize,
}

/// The live poll service.
///
/// Cheap to clone; pass it to request handlers as shared state.
#[derive(Clone)]
pub struct PollService {
    inner: Arc<ServiceInner>,
}

impl PollService {
    /// Start building a service keyed by `voting_secret`.
    #[must_use]
    pub fn builder(voting_secret: SecretBox<Vec<u8>>) -> PollServiceBuilder {
        PollServiceBuilder {
            voting_secret,
            settings: ServiceSettings::default(),
            store: None,
            codes: None,
        }
    }

    // ------------------------------------------------------------------
    // Polls
    // ------------------------------------------------------------------

    /// Create a poll and return its first snapshot.
    ///
    /// # Errors
    ///
    /// See [`PollRegistry::create_poll`].
    pub async fn create_poll(&self, draft: PollDraft) -> Result<Arc<PollSnapshot>, PollError> {
        self.inner.registry.create_poll(draft).await
    }

    /// Current state of a poll, active or ended.
    ///
    /// # Errors
    ///
    /// `NotFound` if no live or stored poll has this code.
    pub async fn get_poll(&self, code: &SessionCode) -> Result<Arc<PollSnapshot>, PollError> {
        Ok(self.inner.registry.resolve(code).await?.snapshot())
    }

    /// Current state of a poll that is still accepting votes.
    ///
    /// # Errors
    ///
    /// `NotFound` if the poll does not exist or has ended.
    pub async fn get_current(&self, code: &SessionCode) -> Result<Arc<PollSnapshot>, PollError> {
        let snapshot = self.get_poll(code).await?;
        if snapshot.status != PollStatus::Active {
            return Err(PollError::NotFound(code.to_string()));
        }
        Ok(snapshot)
    }

    /// Cast a vote as `identity`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `DuplicateVote`, `InvalidOption`, `PollEnded`, `Timeout`
    /// or `Storage`.
    #[instrument(skip_all, name = "poll.service.vote", fields(session_code = %code))]
    pub async fn vote(
        &self,
        code: &SessionCode,
        option_index: usize,
        identity: VoterIdentity,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        let handle = self.inner.registry.resolve(code).await?;
        handle.vote(option_index, identity).await
    }

    /// Mint an anonymous voting token for an active poll.
    ///
    /// # Errors
    ///
    /// `NotFound` if the poll does not exist, `PollEnded` if it has ended.
    pub async fn issue_voting_token(&self, code: &SessionCode) -> Result<VotingToken, PollError> {
        let snapshot = self.get_poll(code).await?;
        if snapshot.status != PollStatus::Active {
            return Err(PollError::PollEnded);
        }
        self.inner.tokens.issue(code)
    }

    /// Cast a vote with a voting token instead of an account.
    ///
    /// # Errors
    ///
    /// `InvalidVotingToken` if the token was not issued for this poll, plus
    /// the errors of [`Self::vote`].
    pub async fn vote_anonymous(
        &self,
        code: &SessionCode,
        option_index: usize,
        token: &VotingToken,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        self.inner.tokens.verify(code, token)?;
        self.vote(code, option_index, token.identity()).await
    }

    /// End a poll on its creator's request.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` if `requester` did not create the poll.
    #[instrument(skip_all, name = "poll.service.end", fields(session_code = %code))]
    pub async fn end_poll(
        &self,
        code: &SessionCode,
        requester: VoterIdentity,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        let handle = self.inner.registry.resolve(code).await?;
        handle.end(EndTrigger::Owner(requester)).await
    }

    /// Delete a poll on its creator's request.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotAuthorized` or `Storage`.
    #[instrument(skip_all, name = "poll.service.delete", fields(session_code = %code))]
    pub async fn delete_poll(
        &self,
        code: &SessionCode,
        requester: &VoterIdentity,
    ) -> Result<(), PollError> {
        let live = self.inner.registry.get(code).await;
        if let Some(handle) = &live {
            if handle.created_by() != requester {
                return Err(not_owner());
            }
        }

        let Some(store) = self.inner.registry.store() else {
            if live.is_none() {
                return Err(PollError::NotFound(code.to_string()));
            }
            self.inner.registry.retire(code, RetireReason::Deleted).await;
            return Ok(());
        };

        // Stop writes before the record goes away
        self.inner.registry.retire(code, RetireReason::Deleted).await;

        match store.delete_by_owner(code, requester).await? {
            DeleteOutcome::Deleted => {
                info!(
                    target: "poll.service",
                    session_code = %code,
                    "Poll deleted"
                );
                Ok(())
            }
            DeleteOutcome::NotOwner => Err(not_owner()),
            DeleteOutcome::NotFound => Err(PollError::NotFound(code.to_string())),
        }
    }

    /// Every poll `owner` created, newest first.
    ///
    /// Live state wins over stored state for polls in memory. Listing does
    /// not count as activity on the listed polls.
    ///
    /// # Errors
    ///
    /// `Storage` if the owner index cannot be read.
    pub async fn list_polls_for_owner(
        &self,
        owner: &VoterIdentity,
    ) -> Result<Vec<Arc<PollSnapshot>>, PollError> {
        let now = Utc::now();
        let mut polls = self
            .live_snapshots(now, |handle, _| handle.created_by() == owner)
            .await;

        if let Some(store) = self.inner.registry.store() {
            merge_stored(&mut polls, store.list_by_owner(owner).await?, now);
        }

        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    /// Polls `viewer` may browse, newest first: every public poll, plus the
    /// viewer's own private ones.
    ///
    /// # Errors
    ///
    /// `Storage` if the public or owner index cannot be read.
    pub async fn list_visible_polls(
        &self,
        viewer: Option<&VoterIdentity>,
    ) -> Result<Vec<Arc<PollSnapshot>>, PollError> {
        let now = Utc::now();
        let mut polls = self
            .live_snapshots(now, |handle, snapshot| {
                snapshot.is_public || viewer == Some(handle.created_by())
            })
            .await;

        if let Some(store) = self.inner.registry.store() {
            let mut records = store.list_public().await?;
            if let Some(viewer) = viewer {
                records.extend(store.list_by_owner(viewer).await?);
            }
            merge_stored(&mut polls, records, now);
        }

        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(polls)
    }

    async fn live_snapshots(
        &self,
        now: DateTime<Utc>,
        keep: impl Fn(&PollActorHandle, &PollSnapshot) -> bool,
    ) -> Vec<Arc<PollSnapshot>> {
        self.inner
            .registry
            .live_polls()
            .await
            .into_iter()
            .filter_map(|handle| {
                let snapshot = handle.committed();
                keep(&handle, &*snapshot).then(|| snapshot.observed_at(now))
            })
            .collect()
    }

    /// Totals over every poll `owner` created.
    ///
    /// # Errors
    ///
    /// See [`Self::list_polls_for_owner`].
    pub async fn get_stats_for_owner(&self, owner: &VoterIdentity) -> Result<OwnerStats, PollError> {
        let polls = self.list_polls_for_owner(owner).await?;
        Ok(OwnerStats {
            total_polls: polls.len(),
            total_votes: polls.iter().map(|poll| poll.total_votes).sum(),
            active_voters: polls.iter().filter(|poll| poll.total_votes > 0).count(),
        })
    }

    // ------------------------------------------------------------------
    // Live updates
    // ------------------------------------------------------------------

    /// Watch a poll. Events go to `sink`; the current snapshot is returned.
    ///
    /// # Errors
    ///
    /// `NotFound` if the poll does not exist.
    #[instrument(skip_all, name = "poll.service.subscribe", fields(session_code = %code, connection_id = %connection_id))]
    pub async fn subscribe(
        &self,
        connection_id: &ConnectionId,
        code: &SessionCode,
        sink: mpsc::Sender<PollEvent>,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        // Reload a stored poll first so its room exists
        self.inner.registry.resolve(code).await?;
        self.inner.hub.subscribe(connection_id, code, sink).await
    }

    /// Stop watching a poll. Returns `false` if the connection was not watching.
    pub async fn unsubscribe(&self, connection_id: &ConnectionId, code: &SessionCode) -> bool {
        self.inner.hub.unsubscribe(connection_id, code).await
    }

    /// A connection went away; drop all its subscriptions.
    pub async fn connection_closed(&self, connection_id: &ConnectionId) -> usize {
        self.inner.hub.connection_closed(connection_id).await
    }

    /// Number of connections watching a poll.
    pub async fn subscriber_count(&self, code: &SessionCode) -> usize {
        self.inner.hub.subscriber_count(code).await
    }

    /// Capacity to use for a live connection's event queue.
    #[must_use]
    pub fn subscriber_buffer(&self) -> usize {
        self.inner.subscriber_buffer
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Run a lifecycle sweep now instead of waiting for the next tick.
    pub async fn sweep(&self) -> SweepReport {
        self.inner.lifecycle.sweep(Utc::now()).await
    }

    pub async fn status(&self) -> RegistryStatus {
        self.inner.registry.status().await
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.inner.metrics
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.registry.is_accepting()
    }

    /// Stop accepting polls, close every live connection and stop all tasks.
    pub async fn shutdown(&self, deadline: Duration) {
        info!(
            target: "poll.service",
            "Poll service shutting down"
        );

        self.inner.registry.shutdown(deadline).await;
        self.inner.cancel_token.cancel();

        let lifecycle_task = self
            .inner
            .lifecycle_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = lifecycle_task {
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!(
                    target: "poll.service",
                    "Lifecycle task did not stop in time"
                );
            }
        }

        info!(
            target: "poll.service",
            "Poll service stopped"
        );
    }
}

fn not_owner() -> PollError {
    PollError::NotAuthorized("Only the poll creator can delete this poll".to_string())
}

/// Append stored polls that are not already listed.
fn merge_stored(polls: &mut Vec<Arc<PollSnapshot>>, records: Vec<PollRecord>, now: DateTime<Utc>) {
    let mut seen: HashSet<SessionCode> =
        polls.iter().map(|poll| poll.session_code.clone()).collect();

    for record in records {
        if !seen.insert(record.session_code.clone()) {
            continue;
        }
        let code = record.session_code.clone();
        match VoteLedger::from_record(record) {
            Ok(ledger) => polls.push(Arc::new(ledger.snapshot()).observed_at(now)),
            Err(e) => warn!(
                target: "poll.service",
                session_code = %code,
                error = %e,
                "Skipping unreadable stored poll"
            ),
        }
    }
}
