//! `SubscriberActor` - per-subscription actor that feeds one live connection.
//!
//! Each `SubscriberActor`:
//! - Watches its poll's room for new snapshots and participant counts
//! - Forwards them to the connection's bounded event sink
//! - Never forwards a snapshot older than one it already sent
//! - Reports its own departure to the hub when it stops for any reason
//!
//! A slow connection only ever blocks its own actor. While it is blocked,
//! the watch channel keeps just the newest snapshot, so intermediate
//! snapshots are skipped rather than queued.

use super::messages::{CloseReason, PollEvent, SubscriberMessage};
use super::metrics::{ActorType, MailboxMonitor};
use crate::ledger::PollSnapshot;
use crate::observability::metrics;

use common::types::{ConnectionId, SessionCode};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Default channel buffer size for the subscriber mailbox.
const SUBSCRIBER_CHANNEL_BUFFER: usize = 4;

/// Sent to the hub when a subscriber actor stops.
#[derive(Debug)]
pub(crate) struct Departure {
    pub session_code: SessionCode,
    pub connection_id: ConnectionId,
    pub subscription_id: u64,
}

/// Everything a subscriber actor needs to start.
pub(crate) struct SubscriberSetup {
    pub connection_id: ConnectionId,
    pub session_code: SessionCode,
    pub subscription_id: u64,
    pub snapshots: watch::Receiver<Arc<PollSnapshot>>,
    pub participants: watch::Receiver<usize>,
    pub sink: mpsc::Sender<PollEvent>,
    /// Version already handed to the connection at subscribe time.
    pub last_version: u64,
    pub departures: mpsc::UnboundedSender<Departure>,
    pub cancel_token: CancellationToken,
}

/// Handle to a `SubscriberActor`.
#[derive(Clone)]
pub struct SubscriberActorHandle {
    sender: mpsc::Sender<SubscriberMessage>,
    cancel_token: CancellationToken,
    subscription_id: u64,
}

impl SubscriberActorHandle {
    #[must_use]
    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// Tell the connection why it is being dropped, then stop the actor.
    ///
    /// Falls back to plain cancellation when the mailbox is full or gone.
    pub fn close(&self, reason: CloseReason) {
        if self
            .sender
            .try_send(SubscriberMessage::Close { reason })
            .is_err()
        {
            self.cancel_token.cancel();
        }
    }

    /// Stop the actor without a final event.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// How the actor's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Cancelled,
    Closed(CloseReason),
    SinkClosed,
}

/// The `SubscriberActor` implementation.
pub struct SubscriberActor {
    connection_id: ConnectionId,
    session_code: SessionCode,
    subscription_id: u64,
    receiver: mpsc::Receiver<SubscriberMessage>,
    cancel_token: CancellationToken,
    snapshots: watch::Receiver<Arc<PollSnapshot>>,
    participants: watch::Receiver<usize>,
    sink: mpsc::Sender<PollEvent>,
    last_version: u64,
    departures: mpsc::UnboundedSender<Departure>,
    mailbox: MailboxMonitor,
}

impl SubscriberActor {
    /// Spawn a new subscriber actor.
    pub(crate) fn spawn(setup: SubscriberSetup) -> (SubscriberActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_BUFFER);

        let handle = SubscriberActorHandle {
            sender,
            cancel_token: setup.cancel_token.clone(),
            subscription_id: setup.subscription_id,
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Subscriber, setup.connection_id.0.clone()),
            connection_id: setup.connection_id,
            session_code: setup.session_code,
            subscription_id: setup.subscription_id,
            receiver,
            cancel_token: setup.cancel_token,
            snapshots: setup.snapshots,
            participants: setup.participants,
            sink: setup.sink,
            last_version: setup.last_version,
            departures: setup.departures,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor loop.
    #[instrument(
        skip_all,
        name = "poll.actor.subscriber",
        fields(session_code = %self.session_code, connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "poll.actor.subscriber",
            session_code = %self.session_code,
            connection_id = %self.connection_id,
            "SubscriberActor started"
        );

        let exit = loop {
            tokio::select! {
                // A queued close must win over the cancellation that follows it
                biased;

                msg = self.receiver.recv() => {
                    match msg {
                        Some(SubscriberMessage::Close { reason }) => {
                            self.mailbox.record_received(self.receiver.len());
                            self.mailbox.record_processed();
                            break Exit::Closed(reason);
                        }
                        None => break Exit::Cancelled,
                    }
                }

                () = self.cancel_token.cancelled() => break Exit::Cancelled,

                () = self.sink.closed() => break Exit::SinkClosed,

                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        break Exit::Closed(self.pending_close_reason());
                    }
                    let snapshot = Arc::clone(&self.snapshots.borrow_and_update());
                    if snapshot.version > self.last_version {
                        self.last_version = snapshot.version;
                        if !self.deliver(PollEvent::Snapshot { poll: snapshot }).await {
                            break self.failed_delivery_exit();
                        }
                    }
                }

                changed = self.participants.changed() => {
                    if changed.is_err() {
                        break Exit::Closed(self.pending_close_reason());
                    }
                    let count = *self.participants.borrow_and_update();
                    if !self.deliver(PollEvent::Participants { count }).await {
                        break self.failed_delivery_exit();
                    }
                }
            }
        };

        match exit {
            Exit::Closed(reason) => {
                // Best effort; the stream ends when this actor drops the sink either way
                let _ = self.sink.try_send(PollEvent::Closed { reason });
            }
            Exit::SinkClosed => {
                metrics::record_broadcast_failure();
            }
            Exit::Cancelled => {}
        }

        let _ = self.departures.send(Departure {
            session_code: self.session_code.clone(),
            connection_id: self.connection_id.clone(),
            subscription_id: self.subscription_id,
        });

        debug!(
            target: "poll.actor.subscriber",
            session_code = %self.session_code,
            connection_id = %self.connection_id,
            exit = ?exit,
            last_version = self.last_version,
            "SubscriberActor stopped"
        );
    }

    /// Push one event, giving up if the actor is cancelled or the sink closes.
    async fn deliver(&self, event: PollEvent) -> bool {
        tokio::select! {
            result = self.sink.send(event) => result.is_ok(),
            () = self.cancel_token.cancelled() => false,
        }
    }

    fn failed_delivery_exit(&self) -> Exit {
        if self.cancel_token.is_cancelled() {
            Exit::Cancelled
        } else {
            Exit::SinkClosed
        }
    }

    /// The room went away; use the reason the hub queued, if any.
    fn pending_close_reason(&mut self) -> CloseReason {
        match self.receiver.try_recv() {
            Ok(SubscriberMessage::Close { reason }) => reason,
            Err(_) => CloseReason::Retired,
        }
    }
}
