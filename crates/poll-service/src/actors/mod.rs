//! Actor model for the poll service.
//!
//! ```text
//! PollRegistry (one per process)
//! └── owns N PollActors
//!     └── PollActor (one per live poll)
//!         └── owns the poll's VoteLedger, publishes snapshots to its room
//!
//! SubscriptionHub (one per process)
//! └── owns N rooms
//!     └── SubscriberActor (one per connection watching a poll)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per poll**: every vote and transition for a poll goes
//!   through that poll's mailbox, so the one-vote rule needs no locks
//! - **Snapshot swap**: reads borrow the latest immutable snapshot and never
//!   queue behind votes
//! - **CancellationToken propagation**: the registry and hub hand child tokens
//!   to their actors for graceful shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Poll: 100/500,
//!   Subscriber: 8/16)
//!
//! # Modules
//!
//! - [`poll`] - `PollActor` per live poll, owns the ledger
//! - [`subscriber`] - `SubscriberActor` per live subscription
//! - [`messages`] - Message and event types
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod poll;
pub mod subscriber;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use poll::{PollActor, PollActorHandle};
pub use subscriber::{SubscriberActor, SubscriberActorHandle};
