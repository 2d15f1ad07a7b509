//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Poll       | < 100  | 100-500 | > 500    |
//! | Subscriber | < 8    | 8-16    | > 16     |
//!
//! Poll actors queue votes, so their mailbox grows with vote bursts. Subscriber
//! actors only ever receive control messages and should sit near zero.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for poll actors.
pub const POLL_MAILBOX_NORMAL: usize = 100;
pub const POLL_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for subscriber actors.
pub const SUBSCRIBER_MAILBOX_NORMAL: usize = 8;
pub const SUBSCRIBER_MAILBOX_WARNING: usize = 16;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `PollActor` (one per live poll).
    Poll,
    /// `SubscriberActor` (one per live subscription).
    Subscriber,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Poll => "poll",
            ActorType::Subscriber => "subscriber",
        }
    }

    /// Returns the warning threshold for this actor type.
    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Poll => POLL_MAILBOX_WARNING,
            ActorType::Subscriber => SUBSCRIBER_MAILBOX_WARNING,
        }
    }

    /// Returns the normal threshold for this actor type.
    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Poll => POLL_MAILBOX_NORMAL,
            ActorType::Subscriber => SUBSCRIBER_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Tracks one actor's queue depth as it drains its mailbox.
///
/// The actor reports the backlog it sees each time it takes a message, so
/// the depth reflects messages still waiting behind the one being handled.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Session code or connection ID.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record the backlog observed when a message is taken off the queue.
    pub fn record_received(&self, backlog: usize) {
        let previous = self.depth.swap(backlog, Ordering::Relaxed);
        self.peak_depth.fetch_max(backlog, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), backlog);

        match self.level_for_depth(backlog) {
            MailboxLevel::Critical => {
                warn!(
                    target: "poll.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if self.level_for_depth(previous) == MailboxLevel::Normal => {
                // Log once when crossing into warning
                debug!(
                    target: "poll.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = backlog,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message fully handled.
    pub fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth >= self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated metrics for the actor system.
///
/// Shared by the registry, hub and every actor. Gauges are mirrored to
/// Prometheus on each change.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Live polls held in memory.
    pub active_polls: AtomicUsize,
    /// Live subscriptions across all polls.
    pub active_subscribers: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn poll_started(&self) {
        let count = self.active_polls.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_polls_active(count);
    }

    pub fn poll_retired(&self) {
        let count = self
            .active_polls
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::set_polls_active(count);
    }

    pub fn subscriber_added(&self) {
        let count = self.active_subscribers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_subscribers_active(count);
    }

    pub fn subscriber_removed(&self) {
        let count = self
            .active_subscribers
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::set_subscribers_active(count);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        metrics::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "poll.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.active_polls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.active_subscribers.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_as_str() {
        assert_eq!(ActorType::Poll.as_str(), "poll");
        assert_eq!(ActorType::Subscriber.as_str(), "subscriber");
    }

    #[test]
    fn test_mailbox_monitor_tracks_backlog_and_peak() {
        let monitor = MailboxMonitor::new(ActorType::Poll, "AB23CD");
        assert_eq!(monitor.current_depth(), 0);

        monitor.record_received(3);
        monitor.record_processed();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_received(1);
        monitor.record_processed();
        assert_eq!(monitor.current_depth(), 1);
        assert_eq!(monitor.peak_depth(), 3); // Peak stays at 3
        assert_eq!(monitor.messages_processed(), 2);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new(ActorType::Poll, "AB23CD");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        monitor.record_received(150);
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        monitor.record_received(501);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);

        monitor.record_received(0);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);
    }

    #[test]
    fn test_mailbox_monitor_subscriber_thresholds() {
        let monitor = MailboxMonitor::new(ActorType::Subscriber, "conn-456");

        monitor.record_received(4);
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        monitor.record_received(10);
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        monitor.record_received(17);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.poll_started();
        metrics.poll_started();
        metrics.subscriber_added();
        assert_eq!(metrics.poll_count(), 2);
        assert_eq!(metrics.subscriber_count(), 1);

        metrics.poll_retired();
        metrics.subscriber_removed();
        assert_eq!(metrics.poll_count(), 1);
        assert_eq!(metrics.subscriber_count(), 0);
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();

        metrics.record_panic(ActorType::Poll);
        metrics.record_panic(ActorType::Subscriber);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 2);
    }
}
