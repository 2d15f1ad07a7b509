//! Pre-configured test data and helpers for poll service testing.
//!
//! Provides:
//! - Identities and poll drafts
//! - A voting-token secret and ready-made services
//! - `RecordingSink`, the receiving end of a live subscription

use common::secret::SecretBox;
use common::types::{SessionCode, VoterIdentity};
use poll_service::actors::PollEvent;
use poll_service::code::SessionCodeGenerator;
use poll_service::ledger::{PollDraft, PollSnapshot};
use poll_service::lifecycle::LifecycleSettings;
use poll_service::registry::RegistrySettings;
use poll_service::service::{PollService, ServiceSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::mock_store::MemoryPollStore;

/// Default wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// An authenticated account identity.
#[must_use]
pub fn account(id: &str) -> VoterIdentity {
    VoterIdentity::Account(id.to_string())
}

/// A session code literal. Panics on a malformed code.
#[must_use]
pub fn code(raw: &str) -> SessionCode {
    SessionCode::parse(raw).expect("fixture session code should parse")
}

/// "Coffee or tea?" with options Coffee and Tea.
#[must_use]
pub fn coffee_or_tea(owner: VoterIdentity) -> PollDraft {
    PollDraft::new("Coffee or tea?", ["Coffee", "Tea"], owner)
}

/// A draft with `count` numbered options.
#[must_use]
pub fn numbered_poll(owner: VoterIdentity, count: usize) -> PollDraft {
    PollDraft::new(
        "Pick a number",
        (0..count).map(|i| format!("Option {i}")),
        owner,
    )
}

/// A 32-byte voting-token master secret.
#[must_use]
pub fn test_voting_secret() -> SecretBox<Vec<u8>> {
    SecretBox::new(Box::new(b"poll-test-voting-secret-32-bytes".to_vec()))
}

/// Settings with short timeouts and a sweep interval long enough that
/// tests drive sweeps themselves.
#[must_use]
pub fn test_settings() -> ServiceSettings {
    ServiceSettings {
        registry: RegistrySettings {
            instance_id: "poll-test".to_string(),
            max_active_polls: 1000,
            operation_timeout: Duration::from_secs(2),
        },
        lifecycle: LifecycleSettings {
            sweep_interval: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
        },
        subscriber_buffer: 32,
    }
}

/// An ephemeral service with [`test_settings`].
#[must_use]
pub fn ephemeral_service() -> PollService {
    PollService::builder(test_voting_secret())
        .settings(test_settings())
        .build()
        .expect("test service should build")
}

/// A durable service writing through to `store`.
#[must_use]
pub fn durable_service(store: &MemoryPollStore) -> PollService {
    PollService::builder(test_voting_secret())
        .settings(test_settings())
        .store(store.shared())
        .build()
        .expect("test service should build")
}

/// A service that hands out `codes` in order.
#[must_use]
pub fn service_with_codes(codes: &[&str]) -> PollService {
    PollService::builder(test_voting_secret())
        .settings(test_settings())
        .code_generator(SessionCodeGenerator::from_sequence(
            codes.iter().map(|raw| code(raw)),
        ))
        .build()
        .expect("test service should build")
}

/// Receiving end of a live subscription, recording everything it sees.
pub struct RecordingSink {
    receiver: mpsc::Receiver<PollEvent>,
    seen: Vec<PollEvent>,
}

impl RecordingSink {
    /// A sender to pass to `subscribe` and the sink that records it.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<PollEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            sender,
            Self {
                receiver,
                seen: Vec::new(),
            },
        )
    }

    /// Next event, or `None` on timeout or when the sender side is gone.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<PollEvent> {
        let event = tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()?;
        self.seen.push(event.clone());
        Some(event)
    }

    /// Wait for a snapshot matching `predicate`, skipping other events.
    ///
    /// Panics if none arrives within [`EVENT_TIMEOUT`].
    pub async fn wait_for_snapshot(
        &mut self,
        predicate: impl Fn(&PollSnapshot) -> bool,
    ) -> Arc<PollSnapshot> {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(remaining).await {
                Some(PollEvent::Snapshot { poll }) if predicate(&poll) => return poll,
                Some(_) => {}
                None => panic!("no matching snapshot within {EVENT_TIMEOUT:?}"),
            }
        }
    }

    /// Wait for a participant count of `count`, skipping other events.
    ///
    /// Panics if it does not arrive within [`EVENT_TIMEOUT`].
    pub async fn wait_for_participants(&mut self, count: usize) {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event(remaining).await {
                Some(PollEvent::Participants { count: seen }) if seen == count => return,
                Some(_) => {}
                None => panic!("participant count never reached {count}"),
            }
        }
    }

    /// Read events until the stream ends or goes quiet for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<PollEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.next_event(quiet).await {
            drained.push(event);
        }
        drained
    }

    /// Every event received so far, in order.
    #[must_use]
    pub fn seen(&self) -> &[PollEvent] {
        &self.seen
    }

    /// Versions of every snapshot received so far, in order.
    #[must_use]
    pub fn snapshot_versions(&self) -> Vec<u64> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                PollEvent::Snapshot { poll } => Some(poll.version),
                _ => None,
            })
            .collect()
    }
}
