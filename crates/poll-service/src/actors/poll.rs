//! `PollActor` - per-poll actor that owns one [`VoteLedger`].
//!
//! Each `PollActor`:
//! - Is the only writer of its ledger, so votes and transitions for one poll
//!   are applied one at a time in mailbox order
//! - Writes each mutation through to the store (when configured) before it
//!   becomes visible, rolling the ledger back if the write fails
//! - Swaps a fresh immutable [`PollSnapshot`] into a watch channel after every
//!   committed mutation, so reads never wait on the mailbox
//! - Publishes the same snapshot to the [`SubscriptionHub`]
//!
//! # End dates
//!
//! There is no timer per poll. A vote arriving after the end date commits the
//! `Expired` transition first and is then rejected. Readers that notice the
//! end date has passed see the poll as ended immediately and nudge the actor
//! with [`PollMessage::Expire`].

use super::messages::{EndTrigger, PollMessage};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::errors::PollError;
use crate::hub::SubscriptionHub;
use crate::ledger::{EndReason, PollSnapshot, PollStatus, VoteLedger};
use crate::observability::metrics;
use crate::storage::PollStore;

use chrono::{DateTime, Utc};
use common::types::{SessionCode, VoterIdentity};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the poll mailbox.
const POLL_CHANNEL_BUFFER: usize = 500;

/// When a poll was last voted on or read through its handle.
#[derive(Debug)]
struct ActivityClock {
    origin: Instant,
    last_millis: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Handle to a `PollActor`.
#[derive(Clone)]
pub struct PollActorHandle {
    sender: mpsc::Sender<PollMessage>,
    cancel_token: CancellationToken,
    session_code: SessionCode,
    created_by: VoterIdentity,
    created_at: DateTime<Utc>,
    snapshots: watch::Receiver<Arc<PollSnapshot>>,
    operation_timeout: Duration,
    activity: Arc<ActivityClock>,
}

impl PollActorHandle {
    #[must_use]
    pub fn session_code(&self) -> &SessionCode {
        &self.session_code
    }

    #[must_use]
    pub fn created_by(&self) -> &VoterIdentity {
        &self.created_by
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Latest committed snapshot, as a reader sees it now.
    ///
    /// Never waits on the actor. If the end date has passed but the actor has
    /// not yet committed the transition, the returned snapshot already reads
    /// as ended and the actor is asked to catch up.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PollSnapshot> {
        self.activity.touch();
        let current = Arc::clone(&self.snapshots.borrow());
        let now = Utc::now();

        if current.status == PollStatus::Active && current.is_expired_at(now) {
            // Full mailbox means the actor is busy and will expire the poll on its next vote
            let _ = self.sender.try_send(PollMessage::Expire);
        }

        current.observed_at(now)
    }

    /// Latest snapshot exactly as the actor committed it, without read-time expiry.
    ///
    /// Does not count as activity.
    #[must_use]
    pub fn committed(&self) -> Arc<PollSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Time since the poll was last voted on, ended or read via [`Self::snapshot`].
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// A receiver that observes every committed snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<PollSnapshot>> {
        self.snapshots.clone()
    }

    /// Record a vote.
    ///
    /// # Errors
    ///
    /// `DuplicateVote`, `InvalidOption` or `PollEnded` from the ledger,
    /// `Storage` if write-through fails, `Timeout` if the actor does not answer
    /// in time, `NotFound` if the poll was retired meanwhile.
    pub async fn vote(
        &self,
        option_index: usize,
        identity: VoterIdentity,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        self.activity.touch();
        let started = Instant::now();
        let result = self
            .request("vote", |respond_to| PollMessage::Vote {
                option_index,
                identity,
                respond_to,
            })
            .await;

        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) => e.metric_label(),
        };
        metrics::record_vote(outcome, started.elapsed());
        result
    }

    /// End the poll.
    ///
    /// Ending an already-ended poll returns its final snapshot unchanged.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` if an owner trigger names someone other than the
    /// creator, plus the transport errors of [`Self::vote`].
    pub async fn end(&self, trigger: EndTrigger) -> Result<Arc<PollSnapshot>, PollError> {
        if matches!(trigger, EndTrigger::Owner(_)) {
            self.activity.touch();
        }
        self.request("end", |respond_to| PollMessage::End {
            trigger,
            respond_to,
        })
        .await
    }

    /// Send a request and wait for the reply within the operation deadline.
    async fn request<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(oneshot::Sender<Result<T, PollError>>) -> PollMessage,
    ) -> Result<T, PollError> {
        let (tx, rx) = oneshot::channel();
        let message = build(tx);

        let exchange = async {
            self.sender
                .send(message)
                .await
                .map_err(|_| PollError::NotFound(self.session_code.to_string()))?;

            rx.await
                .map_err(|_| PollError::NotFound(self.session_code.to_string()))?
        };

        match tokio::time::timeout(self.operation_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                metrics::record_operation_timeout(operation);
                warn!(
                    target: "poll.actor.poll",
                    session_code = %self.session_code,
                    operation,
                    timeout_ms = u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Poll did not answer in time"
                );
                Err(PollError::Timeout(operation.to_string()))
            }
        }
    }

    /// Cancel the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `PollActor` implementation.
pub struct PollActor {
    session_code: SessionCode,
    receiver: mpsc::Receiver<PollMessage>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    ledger: VoteLedger,
    store: Option<Arc<dyn PollStore>>,
    snapshots: watch::Sender<Arc<PollSnapshot>>,
    hub: SubscriptionHub,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl PollActor {
    /// Spawn a new poll actor owning `ledger`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        ledger: VoteLedger,
        store: Option<Arc<dyn PollStore>>,
        hub: SubscriptionHub,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        operation_timeout: Duration,
    ) -> (PollActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(POLL_CHANNEL_BUFFER);
        let (snapshots, snapshot_rx) = watch::channel(Arc::new(ledger.snapshot()));
        let session_code = ledger.session_code().clone();

        let handle = PollActorHandle {
            sender,
            cancel_token: cancel_token.clone(),
            session_code: session_code.clone(),
            created_by: ledger.created_by().clone(),
            created_at: ledger.created_at(),
            snapshots: snapshot_rx,
            operation_timeout,
            activity: Arc::new(ActivityClock::new()),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Poll, session_code.as_str()),
            session_code,
            receiver,
            cancel_token,
            ledger,
            store,
            snapshots,
            hub,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "poll.actor.poll", fields(session_code = %self.session_code))]
    async fn run(mut self) {
        debug!(
            target: "poll.actor.poll",
            session_code = %self.session_code,
            status = self.ledger.status().as_str(),
            "PollActor started"
        );

        loop {
            tokio::select! {
                // Nothing is applied once retirement has begun
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "poll.actor.poll",
                        session_code = %self.session_code,
                        "PollActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "poll.actor.poll",
                                session_code = %self.session_code,
                                "PollActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "poll.actor.poll",
            session_code = %self.session_code,
            status = self.ledger.status().as_str(),
            total_votes = self.ledger.total_votes(),
            messages_processed = self.mailbox.messages_processed(),
            "PollActor stopped"
        );
    }

    async fn handle_message(&mut self, message: PollMessage) {
        match message {
            PollMessage::Vote {
                option_index,
                identity,
                respond_to,
            } => {
                // The caller already timed out; applying now would record a vote nobody saw succeed
                if respond_to.is_closed() {
                    debug!(
                        target: "poll.actor.poll",
                        session_code = %self.session_code,
                        "Dropping vote whose requester gave up"
                    );
                    return;
                }
                let result = self.handle_vote(option_index, identity).await;
                let _ = respond_to.send(result);
            }

            PollMessage::End {
                trigger,
                respond_to,
            } => {
                let result = self.handle_end(trigger).await;
                let _ = respond_to.send(result);
            }

            PollMessage::Expire => {
                self.expire_if_due(Utc::now()).await;
            }
        }
    }

    async fn handle_vote(
        &mut self,
        option_index: usize,
        identity: VoterIdentity,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        let now = Utc::now();
        self.expire_if_due(now).await;

        let applied = self.ledger.apply_vote(option_index, identity, now)?;

        if let Err(e) = self.persist().await {
            self.ledger.rollback_vote(applied);
            return Err(e);
        }

        Ok(self.publish().await)
    }

    async fn handle_end(&mut self, trigger: EndTrigger) -> Result<Arc<PollSnapshot>, PollError> {
        if let EndTrigger::Owner(requester) = &trigger {
            if requester != self.ledger.created_by() {
                return Err(PollError::NotAuthorized(
                    "Only the poll creator can end this poll".to_string(),
                ));
            }
        }

        let now = Utc::now();
        if trigger == EndTrigger::Expired && !self.ledger.is_expired_at(now) {
            return Ok(self.current());
        }

        let reason = trigger.reason();
        let Some(transition) = self.ledger.end(reason, now) else {
            return Ok(self.current());
        };

        if let Err(e) = self.persist().await {
            self.ledger.rollback_end(transition);
            return Err(e);
        }

        metrics::record_poll_ended(reason.as_str());
        info!(
            target: "poll.actor.poll",
            session_code = %self.session_code,
            reason = reason.as_str(),
            total_votes = self.ledger.total_votes(),
            "Poll ended"
        );

        Ok(self.publish().await)
    }

    /// Commit the `Expired` transition if the end date has passed.
    async fn expire_if_due(&mut self, now: DateTime<Utc>) {
        if self.ledger.status() != PollStatus::Active || !self.ledger.is_expired_at(now) {
            return;
        }

        let Some(transition) = self.ledger.end(EndReason::Expired, now) else {
            return;
        };

        if let Err(e) = self.persist().await {
            // Votes are still refused by the end-date check; the next access retries
            warn!(
                target: "poll.actor.poll",
                session_code = %self.session_code,
                error = %e,
                "Failed to persist poll expiry"
            );
            self.ledger.rollback_end(transition);
            return;
        }

        metrics::record_poll_ended("expired");
        info!(
            target: "poll.actor.poll",
            session_code = %self.session_code,
            total_votes = self.ledger.total_votes(),
            "Poll expired"
        );
        self.publish().await;
    }

    /// Write the ledger through to the store, if one is configured.
    async fn persist(&self) -> Result<(), PollError> {
        match &self.store {
            Some(store) => store.save(&self.ledger.to_record()).await,
            None => Ok(()),
        }
    }

    /// Swap in a snapshot of the ledger and hand it to subscribers.
    async fn publish(&self) -> Arc<PollSnapshot> {
        let snapshot = Arc::new(self.ledger.snapshot());
        self.snapshots.send_replace(Arc::clone(&snapshot));
        self.hub
            .publish(&self.session_code, Arc::clone(&snapshot))
            .await;
        snapshot
    }

    fn current(&self) -> Arc<PollSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::ledger::PollDraft;
    use crate::storage::{DeleteOutcome, PollRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store that can be told to fail every save.
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        saves: std::sync::Mutex<Vec<PollRecord>>,
    }

    #[async_trait]
    impl PollStore for FlakyStore {
        async fn save(&self, record: &PollRecord) -> Result<(), PollError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PollError::Storage("injected failure".to_string()));
            }
            self.saves.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load(&self, _code: &SessionCode) -> Result<Option<PollRecord>, PollError> {
            Ok(None)
        }

        async fn delete_by_owner(
            &self,
            _code: &SessionCode,
            _owner: &VoterIdentity,
        ) -> Result<DeleteOutcome, PollError> {
            Ok(DeleteOutcome::NotFound)
        }

        async fn list_by_owner(
            &self,
            _owner: &VoterIdentity,
        ) -> Result<Vec<PollRecord>, PollError> {
            Ok(Vec::new())
        }

        async fn list_public(&self) -> Result<Vec<PollRecord>, PollError> {
            Ok(Vec::new())
        }
    }

    fn account(name: &str) -> VoterIdentity {
        VoterIdentity::Account(name.to_string())
    }

    fn ledger(end_date: Option<DateTime<Utc>>) -> VoteLedger {
        let mut draft = PollDraft::new("Coffee or tea?", ["Coffee", "Tea"], account("owner"));
        draft.end_date = end_date;
        VoteLedger::new(SessionCode::parse("AB23CD").unwrap(), draft, Utc::now())
    }

    fn spawn_actor(
        ledger: VoteLedger,
        store: Option<Arc<dyn PollStore>>,
    ) -> (PollActorHandle, JoinHandle<()>) {
        let cancel_token = CancellationToken::new();
        let (hub, _events) = SubscriptionHub::new(cancel_token.child_token(), ActorMetrics::new());
        PollActor::spawn(
            ledger,
            store,
            hub,
            cancel_token,
            ActorMetrics::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_vote_updates_snapshot() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        let snapshot = handle.vote(0, account("alice")).await.unwrap();
        assert_eq!(snapshot.tally, vec![1, 0]);
        assert_eq!(snapshot.version, 2);

        // Reads see the committed snapshot without going through the mailbox
        assert_eq!(handle.snapshot().tally, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_duplicate_vote_rejected() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        handle.vote(0, account("alice")).await.unwrap();
        handle.vote(1, account("bob")).await.unwrap();
        let result = handle.vote(0, account("alice")).await;

        assert!(matches!(result, Err(PollError::DuplicateVote)));
        assert_eq!(handle.snapshot().tally, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_concurrent_votes_from_distinct_identities_all_count() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        let mut tasks = Vec::new();
        for i in 0..50 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.vote(i % 2, account(&format!("voter-{i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.tally, vec![25, 25]);
        assert_eq!(snapshot.total_votes, 50);
    }

    #[tokio::test]
    async fn test_concurrent_votes_from_same_identity_count_once() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.vote(i % 2, account("alice")).await
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(PollError::DuplicateVote) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(handle.snapshot().total_votes, 1);
    }

    #[tokio::test]
    async fn test_end_requires_owner() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        let result = handle.end(EndTrigger::Owner(account("mallory"))).await;
        assert!(matches!(result, Err(PollError::NotAuthorized(_))));
        assert_eq!(handle.snapshot().status, PollStatus::Active);

        let snapshot = handle.end(EndTrigger::Owner(account("owner"))).await.unwrap();
        assert_eq!(snapshot.status, PollStatus::Ended);
        assert_eq!(snapshot.end_reason, Some(EndReason::Owner));
    }

    #[tokio::test]
    async fn test_vote_after_end_rejected_and_read_still_works() {
        let (handle, _task) = spawn_actor(ledger(None), None);
        handle.vote(0, account("alice")).await.unwrap();
        handle.end(EndTrigger::Owner(account("owner"))).await.unwrap();

        let result = handle.vote(1, account("bob")).await;
        assert!(matches!(result, Err(PollError::PollEnded)));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, PollStatus::Ended);
        assert_eq!(snapshot.tally, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_end_twice_returns_final_snapshot() {
        let (handle, _task) = spawn_actor(ledger(None), None);

        let first = handle.end(EndTrigger::Owner(account("owner"))).await.unwrap();
        let second = handle.end(EndTrigger::Abandoned).await.unwrap();

        assert_eq!(first.version, second.version);
        assert_eq!(second.end_reason, Some(EndReason::Owner));
    }

    #[tokio::test]
    async fn test_vote_after_end_date_commits_expiry() {
        let (handle, _task) = spawn_actor(
            ledger(Some(Utc::now() + chrono::Duration::milliseconds(50))),
            None,
        );

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = handle.vote(0, account("alice")).await;
        assert!(matches!(result, Err(PollError::PollEnded)));

        let committed = handle.committed();
        assert_eq!(committed.status, PollStatus::Ended);
        assert_eq!(committed.end_reason, Some(EndReason::Expired));
    }

    #[tokio::test]
    async fn test_failed_write_through_rolls_back() {
        let store = Arc::new(FlakyStore::default());
        let (handle, _task) = spawn_actor(ledger(None), Some(store.clone()));

        handle.vote(0, account("alice")).await.unwrap();
        assert_eq!(store.saves.lock().unwrap().len(), 1);

        store.failing.store(true, Ordering::SeqCst);
        let result = handle.vote(1, account("bob")).await;
        assert!(matches!(result, Err(PollError::Storage(_))));
        assert_eq!(handle.snapshot().tally, vec![1, 0]);

        // bob was not recorded, so a retry succeeds once storage recovers
        store.failing.store(false, Ordering::SeqCst);
        let snapshot = handle.vote(1, account("bob")).await.unwrap();
        assert_eq!(snapshot.tally, vec![1, 1]);
        assert_eq!(snapshot.version, 3);
    }

    #[tokio::test]
    async fn test_failed_end_write_keeps_poll_active() {
        let store = Arc::new(FlakyStore::default());
        let (handle, _task) = spawn_actor(ledger(None), Some(store.clone()));

        store.failing.store(true, Ordering::SeqCst);
        let result = handle.end(EndTrigger::Owner(account("owner"))).await;
        assert!(matches!(result, Err(PollError::Storage(_))));
        assert_eq!(handle.snapshot().status, PollStatus::Active);
    }

    #[tokio::test]
    async fn test_cancelled_actor_reports_not_found() {
        let (handle, task) = spawn_actor(ledger(None), None);

        handle.cancel();
        task.await.unwrap();

        let result = handle.vote(0, account("alice")).await;
        assert!(matches!(result, Err(PollError::NotFound(_))));
        // The last snapshot stays readable
        assert_eq!(handle.snapshot().total_votes, 0);
    }

    #[tokio::test]
    async fn test_snapshot_versions_increase() {
        let (handle, _task) = spawn_actor(ledger(None), None);
        let mut rx = handle.watch();
        let mut last = rx.borrow_and_update().version;

        for i in 0..5 {
            handle.vote(0, account(&format!("v{i}"))).await.unwrap();
            rx.changed().await.unwrap();
            let version = rx.borrow_and_update().version;
            assert!(version > last);
            last = version;
        }
    }
}
