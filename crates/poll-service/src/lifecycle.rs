//! Poll lifecycle background task.
//!
//! Moves polls from active to ended and out of memory:
//! 1. An ephemeral poll whose last subscriber leaves is ended as
//!    `abandoned` and retired right away
//! 2. A periodic sweep commits passed end dates, retires unwatched
//!    ephemeral polls after the idle timeout, and evicts unwatched durable
//!    polls (they reload from storage on next access)
//!
//! A poll counts as idle from the later of two moments: when its last
//! subscriber left, and when it was last voted on or read.
//!
//! End dates are also enforced lazily on every vote and read, so the sweep
//! only decides when an expired poll's transition gets persisted.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token fires or the hub goes away.

use crate::actors::messages::EndTrigger;
use crate::actors::poll::PollActorHandle;
use crate::config::Config;
use crate::hub::{HubEvent, SubscriptionHub};
use crate::ledger::PollStatus;
use crate::registry::{PollRegistry, RetireReason};

use chrono::{DateTime, Utc};
use common::types::SessionCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// How long a poll may sit unwatched before it leaves memory.
    pub idle_timeout: Duration,
}

impl LifecycleSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            idle_timeout: config.ephemeral_idle_timeout(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expiry transitions committed.
    pub expired: usize,
    /// Unwatched ephemeral polls removed.
    pub retired: usize,
    /// Unwatched durable polls dropped from memory.
    pub evicted: usize,
    /// Actors found stopped without being retired.
    pub failed: usize,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives poll transitions that no request triggers directly.
#[derive(Clone)]
pub struct PollLifecycle {
    registry: PollRegistry,
    hub: SubscriptionHub,
    settings: LifecycleSettings,
}

impl PollLifecycle {
    #[must_use]
    pub fn new(registry: PollRegistry, hub: SubscriptionHub, settings: LifecycleSettings) -> Self {
        Self {
            registry,
            hub,
            settings,
        }
    }

    /// Start the lifecycle task.
    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<HubEvent>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, cancel_token))
    }

    #[instrument(skip_all, name = "poll.lifecycle")]
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<HubEvent>,
        cancel_token: CancellationToken,
    ) {
        info!(
            target: "poll.lifecycle",
            sweep_interval_seconds = self.settings.sweep_interval.as_secs(),
            idle_timeout_seconds = self.settings.idle_timeout.as_secs(),
            "Starting poll lifecycle task"
        );

        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is due at startup
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(
                        target: "poll.lifecycle",
                        "Poll lifecycle task received shutdown signal, exiting"
                    );
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }

                _ = interval.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if !report.is_empty() {
                        info!(
                            target: "poll.lifecycle",
                            expired = report.expired,
                            retired = report.retired,
                            evicted = report.evicted,
                            failed = report.failed,
                            "Lifecycle sweep complete"
                        );
                    }
                }
            }
        }

        info!(
            target: "poll.lifecycle",
            "Poll lifecycle task stopped"
        );
    }

    /// React to a hub notification.
    pub async fn handle_event(&self, event: HubEvent) {
        match event {
            HubEvent::RoomEmptied { session_code } => self.room_emptied(&session_code).await,
        }
    }

    /// Ephemeral polls vanish with their last observer.
    async fn room_emptied(&self, code: &SessionCode) {
        if self.registry.is_durable() {
            return;
        }
        let Some(handle) = self.registry.get(code).await else {
            return;
        };
        // Someone may have joined since the event was sent
        if self.hub.subscriber_count(code).await > 0 {
            return;
        }

        if let Err(e) = handle.end(EndTrigger::Abandoned).await {
            warn!(
                target: "poll.lifecycle",
                session_code = %code,
                error = %e,
                "Failed to end abandoned poll"
            );
        }
        if self.hub.subscriber_count(code).await > 0 {
            return;
        }
        self.registry.retire(code, RetireReason::Abandoned).await;
    }

    /// Run one sweep over every live poll.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            failed: self.registry.check_poll_health().await,
            ..SweepReport::default()
        };

        for handle in self.registry.live_polls().await {
            self.sweep_poll(&handle, now, &mut report).await;
        }

        report
    }

    async fn sweep_poll(&self, handle: &PollActorHandle, now: DateTime<Utc>, report: &mut SweepReport) {
        let code = handle.session_code().clone();
        let committed = handle.committed();

        if committed.status == PollStatus::Active && committed.is_expired_at(now) {
            match handle.end(EndTrigger::Expired).await {
                Ok(_) => report.expired += 1,
                Err(e) => warn!(
                    target: "poll.lifecycle",
                    session_code = %code,
                    error = %e,
                    "Failed to commit poll expiry"
                ),
            }
            return;
        }

        let Some(unwatched) = self.hub.idle_for(&code).await else {
            return;
        };
        // Votes and reads over REST keep a poll alive without any viewer
        let idle = unwatched.min(handle.idle_for());

        let durable = self.registry.is_durable();
        let is_ended = committed.status == PollStatus::Ended;

        if durable {
            // Stored polls reload on demand
            if (is_ended || idle >= self.settings.idle_timeout)
                && self.registry.retire(&code, RetireReason::Evicted).await
            {
                report.evicted += 1;
            }
            return;
        }

        if idle < self.settings.idle_timeout {
            return;
        }

        let reason = if is_ended {
            RetireReason::Ended
        } else {
            if let Err(e) = handle.end(EndTrigger::Abandoned).await {
                debug!(
                    target: "poll.lifecycle",
                    session_code = %code,
                    error = %e,
                    "Idle poll could not be ended before retirement"
                );
            }
            RetireReason::Idle
        };

        if self.registry.retire(&code, reason).await {
            report.retired += 1;
        }
    }
}
