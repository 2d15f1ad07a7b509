//! `SubscriptionHub` - rooms of live connections, one room per poll.
//!
//! A room holds the latest snapshot of its poll in a `watch` channel. The
//! poll actor publishes by swapping a newer snapshot in, which never waits
//! on any connection. Each subscription is a [`SubscriberActor`] that pulls
//! from the room's channel and pushes into its own connection sink.
//!
//! # Locking
//!
//! Locks are always taken in this order and never held across a call into
//! a poll actor:
//!
//! 1. `rooms` (read for lookups, write to open/close a room)
//! 2. one room's `state`
//! 3. `connections`
//!
//! Work on one poll's room never takes another room's lock.

use crate::actors::messages::{CloseReason, PollEvent};
use crate::actors::metrics::ActorMetrics;
use crate::actors::subscriber::{
    Departure, SubscriberActor, SubscriberActorHandle, SubscriberSetup,
};
use crate::errors::PollError;
use crate::ledger::PollSnapshot;

use chrono::Utc;
use common::types::{ConnectionId, SessionCode};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Notifications from the hub to the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// The last subscriber of an open room left.
    RoomEmptied { session_code: SessionCode },
}

#[derive(Default)]
struct RoomState {
    subscribers: HashMap<ConnectionId, SubscriberActorHandle>,
    closed: bool,
    /// When the room last became empty; `None` while anyone is watching.
    idle_since: Option<Instant>,
}

struct Room {
    snapshots: watch::Sender<Arc<PollSnapshot>>,
    participants: watch::Sender<usize>,
    state: Mutex<RoomState>,
}

struct HubInner {
    rooms: RwLock<HashMap<SessionCode, Arc<Room>>>,
    /// Reverse index for connection-closed handling.
    connections: Mutex<HashMap<ConnectionId, HashSet<SessionCode>>>,
    departures: mpsc::UnboundedSender<Departure>,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    next_subscription: AtomicU64,
}

/// Tracks which connections watch which poll and fans snapshots out to them.
///
/// Cheap to clone; all clones share the same rooms.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    /// Create a hub and the receiver for its [`HubEvent`]s.
    ///
    /// Spawns a background task that cleans up after subscriber actors that
    /// stop on their own (closed sinks). It exits when `cancel_token` fires
    /// or the hub is dropped.
    #[must_use]
    pub fn new(
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let (departures, departure_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(HubInner {
            rooms: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            departures,
            events,
            cancel_token: cancel_token.clone(),
            metrics,
            next_subscription: AtomicU64::new(1),
        });

        tokio::spawn(run_reaper(
            Arc::downgrade(&inner),
            departure_rx,
            cancel_token,
        ));

        (Self { inner }, event_rx)
    }

    /// Open the room for a poll. No-op if it is already open.
    pub async fn open_room(&self, session_code: &SessionCode, initial: Arc<PollSnapshot>) {
        let mut rooms = self.inner.rooms.write().await;
        if rooms.contains_key(session_code) {
            return;
        }

        let (snapshots, _) = watch::channel(initial);
        let (participants, _) = watch::channel(0);
        rooms.insert(
            session_code.clone(),
            Arc::new(Room {
                snapshots,
                participants,
                state: Mutex::new(RoomState {
                    idle_since: Some(Instant::now()),
                    ..RoomState::default()
                }),
            }),
        );

        debug!(
            target: "poll.hub",
            session_code = %session_code,
            "Room opened"
        );
    }

    /// Hand a new snapshot to every subscriber of `session_code`.
    ///
    /// Snapshots not newer than the room's current one are ignored, so a
    /// late publish can never move subscribers backwards. Returns without
    /// waiting for any connection.
    pub async fn publish(&self, session_code: &SessionCode, snapshot: Arc<PollSnapshot>) {
        let Some(room) = self.room(session_code).await else {
            return;
        };

        let version = snapshot.version;
        let advanced = room.snapshots.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot;
                true
            } else {
                false
            }
        });

        if advanced {
            debug!(
                target: "poll.hub",
                session_code = %session_code,
                version,
                receivers = room.snapshots.receiver_count(),
                "Snapshot published"
            );
        }
    }

    /// Add `connection_id` to the room of `session_code`.
    ///
    /// Events for the subscription go to `sink`. Returns the current
    /// snapshot; the first event pushed to `sink` is always newer than it.
    /// Subscribing a connection that is already in the room replaces its
    /// previous sink.
    ///
    /// # Errors
    ///
    /// Returns `PollError::NotFound` if the room is not open.
    #[instrument(skip_all, name = "poll.hub.subscribe", fields(session_code = %session_code, connection_id = %connection_id))]
    pub async fn subscribe(
        &self,
        connection_id: &ConnectionId,
        session_code: &SessionCode,
        sink: mpsc::Sender<PollEvent>,
    ) -> Result<Arc<PollSnapshot>, PollError> {
        let room = self
            .room(session_code)
            .await
            .ok_or_else(|| PollError::NotFound(session_code.to_string()))?;

        let mut state = room.state.lock().await;
        if state.closed {
            return Err(PollError::NotFound(session_code.to_string()));
        }

        // Subscribe before reading so a publish in between is still delivered
        let mut snapshots = room.snapshots.subscribe();
        let initial = Arc::clone(&snapshots.borrow_and_update());

        let replaced = state.subscribers.remove(connection_id);
        match &replaced {
            Some(previous) => {
                previous.cancel();
                debug!(
                    target: "poll.hub",
                    session_code = %session_code,
                    connection_id = %connection_id,
                    "Replacing existing subscription"
                );
            }
            None => {
                self.inner.metrics.subscriber_added();
                state.idle_since = None;
                room.participants.send_replace(state.subscribers.len() + 1);
            }
        }

        // The new subscriber starts with the current count as its first event
        let mut participants = room.participants.subscribe();
        participants.mark_changed();

        let subscription_id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (handle, _task_handle) = SubscriberActor::spawn(SubscriberSetup {
            connection_id: connection_id.clone(),
            session_code: session_code.clone(),
            subscription_id,
            snapshots,
            participants,
            sink,
            last_version: initial.version,
            departures: self.inner.departures.clone(),
            cancel_token: self.inner.cancel_token.child_token(),
        });

        state.subscribers.insert(connection_id.clone(), handle);

        self.inner
            .connections
            .lock()
            .await
            .entry(connection_id.clone())
            .or_default()
            .insert(session_code.clone());

        debug!(
            target: "poll.hub",
            session_code = %session_code,
            connection_id = %connection_id,
            subscribers = state.subscribers.len(),
            version = initial.version,
            "Connection subscribed"
        );

        Ok(initial.observed_at(Utc::now()))
    }

    /// Remove `connection_id` from the room of `session_code`.
    ///
    /// Returns `true` if the connection was subscribed.
    pub async fn unsubscribe(&self, connection_id: &ConnectionId, session_code: &SessionCode) -> bool {
        self.remove_subscriber(session_code, connection_id, None)
            .await
    }

    /// Drop every subscription held by `connection_id`.
    ///
    /// Returns the number of rooms it left.
    pub async fn connection_closed(&self, connection_id: &ConnectionId) -> usize {
        let codes = self
            .inner
            .connections
            .lock()
            .await
            .remove(connection_id)
            .unwrap_or_default();

        let mut removed = 0;
        for code in codes {
            if self.remove_subscriber(&code, connection_id, None).await {
                removed += 1;
            }
        }

        debug!(
            target: "poll.hub",
            connection_id = %connection_id,
            rooms = removed,
            "Connection closed"
        );
        removed
    }

    /// Close the room of `session_code`, telling every subscriber why.
    ///
    /// Emits no [`HubEvent`]. Returns the number of subscribers dropped.
    pub async fn close_room(&self, session_code: &SessionCode, reason: CloseReason) -> usize {
        let Some(room) = self.inner.rooms.write().await.remove(session_code) else {
            return 0;
        };

        let subscribers: Vec<(ConnectionId, SubscriberActorHandle)> = {
            let mut state = room.state.lock().await;
            state.closed = true;
            state.idle_since = None;
            state.subscribers.drain().collect()
        };

        let dropped = subscribers.len();
        if dropped > 0 {
            let mut connections = self.inner.connections.lock().await;
            for (connection_id, subscriber) in &subscribers {
                subscriber.close(reason);
                self.inner.metrics.subscriber_removed();
                forget_connection(&mut connections, connection_id, session_code);
            }
        }

        info!(
            target: "poll.hub",
            session_code = %session_code,
            reason = reason.as_str(),
            subscribers = dropped,
            "Room closed"
        );
        dropped
    }

    /// Close every room. Used at shutdown.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let codes: Vec<SessionCode> = self.inner.rooms.read().await.keys().cloned().collect();

        let mut dropped = 0;
        for code in codes {
            dropped += self.close_room(&code, reason).await;
        }
        dropped
    }

    /// Number of connections subscribed to `session_code`.
    pub async fn subscriber_count(&self, session_code: &SessionCode) -> usize {
        let Some(room) = self.room(session_code).await else {
            return 0;
        };
        let count = *room.participants.borrow();
        count
    }

    /// How long the room of `session_code` has had no subscribers.
    ///
    /// `None` if the room is not open or someone is watching.
    pub async fn idle_for(&self, session_code: &SessionCode) -> Option<Duration> {
        let room = self.room(session_code).await?;
        let state = room.state.lock().await;
        state.idle_since.map(|since| since.elapsed())
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    async fn room(&self, session_code: &SessionCode) -> Option<Arc<Room>> {
        self.inner.rooms.read().await.get(session_code).cloned()
    }

    /// Remove one subscriber.
    ///
    /// With `expected_subscription_id` set, only that exact subscription is
    /// removed; a newer one for the same connection is left alone.
    async fn remove_subscriber(
        &self,
        session_code: &SessionCode,
        connection_id: &ConnectionId,
        expected_subscription_id: Option<u64>,
    ) -> bool {
        let Some(room) = self.room(session_code).await else {
            return false;
        };

        let mut state = room.state.lock().await;
        let matches = state.subscribers.get(connection_id).is_some_and(|existing| {
            expected_subscription_id.map_or(true, |id| existing.subscription_id() == id)
        });
        if !matches {
            return false;
        }

        let Some(removed) = state.subscribers.remove(connection_id) else {
            return false;
        };
        removed.cancel();
        self.inner.metrics.subscriber_removed();

        let remaining = state.subscribers.len();
        room.participants.send_replace(remaining);

        forget_connection(
            &mut *self.inner.connections.lock().await,
            connection_id,
            session_code,
        );

        debug!(
            target: "poll.hub",
            session_code = %session_code,
            connection_id = %connection_id,
            remaining,
            "Connection unsubscribed"
        );

        if remaining == 0 && !state.closed {
            state.idle_since = Some(Instant::now());
            let _ = self.inner.events.send(HubEvent::RoomEmptied {
                session_code: session_code.clone(),
            });
        }

        true
    }
}

fn forget_connection(
    connections: &mut HashMap<ConnectionId, HashSet<SessionCode>>,
    connection_id: &ConnectionId,
    session_code: &SessionCode,
) {
    if let Some(codes) = connections.get_mut(connection_id) {
        codes.remove(session_code);
        if codes.is_empty() {
            connections.remove(connection_id);
        }
    }
}

/// Removes subscribers whose actors stopped on their own.
async fn run_reaper(
    hub: Weak<HubInner>,
    mut departures: mpsc::UnboundedReceiver<Departure>,
    cancel_token: CancellationToken,
) {
    loop {
        let departure = tokio::select! {
            () = cancel_token.cancelled() => break,
            departure = departures.recv() => departure,
        };

        let Some(departure) = departure else {
            break;
        };
        let Some(inner) = hub.upgrade() else {
            break;
        };

        let hub = SubscriptionHub { inner };
        hub.remove_subscriber(
            &departure.session_code,
            &departure.connection_id,
            Some(departure.subscription_id),
        )
        .await;
    }

    debug!(target: "poll.hub", "Subscriber reaper stopped");
}
