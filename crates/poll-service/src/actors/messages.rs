//! Message types for actor communication.
//!
//! Request/response messages carry a `oneshot::Sender` for the reply.
//! Outbound [`PollEvent`]s are what a live connection receives.

use crate::errors::PollError;
use crate::ledger::{EndReason, PollSnapshot};
use common::types::VoterIdentity;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// PollActor Messages
// ============================================================================

/// Messages sent to a `PollActor`.
#[derive(Debug)]
pub enum PollMessage {
    /// Record a vote.
    Vote {
        option_index: usize,
        identity: VoterIdentity,
        respond_to: oneshot::Sender<Result<Arc<PollSnapshot>, PollError>>,
    },

    /// Move the poll to ended.
    End {
        trigger: EndTrigger,
        respond_to: oneshot::Sender<Result<Arc<PollSnapshot>, PollError>>,
    },

    /// A reader noticed the end date has passed; commit the transition.
    Expire,
}

/// Who or what is ending a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndTrigger {
    /// Explicit request; only the creator is allowed.
    Owner(VoterIdentity),
    /// End date reached.
    Expired,
    /// Ephemeral poll lost its observers.
    Abandoned,
}

impl EndTrigger {
    #[must_use]
    pub fn reason(&self) -> EndReason {
        match self {
            EndTrigger::Owner(_) => EndReason::Owner,
            EndTrigger::Expired => EndReason::Expired,
            EndTrigger::Abandoned => EndReason::Abandoned,
        }
    }
}

// ============================================================================
// SubscriberActor Messages
// ============================================================================

/// Messages sent to a `SubscriberActor`.
#[derive(Debug)]
pub enum SubscriberMessage {
    /// Tell the connection why it is being dropped, then stop.
    Close { reason: CloseReason },
}

/// Why the service stopped sending updates to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The poll left memory (abandoned, deleted or evicted).
    Retired,
    /// The service is shutting down.
    ShuttingDown,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Retired => "retired",
            CloseReason::ShuttingDown => "shutting_down",
        }
    }
}

// ============================================================================
// Outbound events
// ============================================================================

/// Event delivered to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PollEvent {
    /// New poll state. Versions only ever increase for one subscription.
    Snapshot { poll: Arc<PollSnapshot> },
    /// Number of connections watching the poll.
    Participants { count: usize },
    /// No further events will follow.
    Closed { reason: CloseReason },
}

impl PollEvent {
    /// SSE event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PollEvent::Snapshot { .. } => "snapshot",
            PollEvent::Participants { .. } => "participants",
            PollEvent::Closed { .. } => "closed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_end_trigger_reason() {
        assert_eq!(
            EndTrigger::Owner(VoterIdentity::Account("alice".to_string())).reason(),
            EndReason::Owner
        );
        assert_eq!(EndTrigger::Expired.reason(), EndReason::Expired);
        assert_eq!(EndTrigger::Abandoned.reason(), EndReason::Abandoned);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(PollEvent::Participants { count: 3 }).unwrap();
        assert_eq!(json["type"], "participants");
        assert_eq!(json["count"], 3);

        let json = serde_json::to_value(PollEvent::Closed {
            reason: CloseReason::ShuttingDown,
        })
        .unwrap();
        assert_eq!(json["type"], "closed");
        assert_eq!(json["reason"], "shutting_down");
    }
}
