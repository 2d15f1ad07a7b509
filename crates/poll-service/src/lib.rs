//! Live Poll Service Library
//!
//! Core of a live polling system: an owner creates a poll and gets a short
//! session code, participants vote once each, and everyone watching the
//! poll sees the tally change in real time.
//!
//! # Architecture
//!
//! ```text
//! PollService (one per process)
//! ├── PollRegistry   session code -> PollActor
//! │   └── PollActor  owns one VoteLedger, single writer for the poll
//! ├── SubscriptionHub  session code -> room of SubscriberActors
//! └── PollLifecycle  expiry, abandonment and eviction
//! ```
//!
//! # Key Design Decisions
//!
//! - **One vote per identity**: enforced inside the poll's actor, so two
//!   concurrent votes from one identity can never both count
//! - **Snapshots, not locks, for reads**: readers get an immutable
//!   `Arc<PollSnapshot>` that is never half-updated
//! - **Per-subscriber coalescing**: a slow connection skips intermediate
//!   snapshots but never sees versions go backwards
//! - **Anonymous voting tokens**: anonymous voters are keyed by an HMAC
//!   token the server issued for that poll, not by a display name
//! - **Optional durability**: with a [`storage::PollStore`] every vote is
//!   written through before it is acknowledged
//!
//! # Modules
//!
//! - [`service`] - `PollService`, the entry point for callers
//! - [`ledger`] - Poll state and the one-vote rule
//! - [`registry`] - Live polls by session code
//! - [`hub`] - Live connections watching polls
//! - [`lifecycle`] - Background expiry and cleanup
//! - [`actors`] - Poll and subscriber actors
//! - [`routes`] / [`handlers`] - HTTP and Server-Sent Events API

pub mod actors;
pub mod code;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod hub;
pub mod ledger;
pub mod lifecycle;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod service;
pub mod storage;
pub mod voting_token;
