//! # Poll Test Utilities
//!
//! Shared test utilities for the live poll service.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory `PollStore` with failure injection
//! - `fixtures` - Identities, drafts, ready-made services and a recording
//!   subscriber sink
//!
//! ## Usage
//!
//! ```rust,ignore
//! use poll_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = MemoryPollStore::new();
//!     let service = durable_service(&store);
//!
//!     let poll = service
//!         .create_poll(coffee_or_tea(account("owner")))
//!         .await
//!         .unwrap();
//!
//!     let (sink, mut events) = RecordingSink::channel(8);
//!     service
//!         .subscribe(&ConnectionId::new(), &poll.session_code, sink)
//!         .await
//!         .unwrap();
//!
//!     service
//!         .vote(&poll.session_code, 0, account("alice"))
//!         .await
//!         .unwrap();
//!     events.wait_for_snapshot(|p| p.total_votes == 1).await;
//! }
//! ```

pub mod fixtures;
pub mod mock_store;

pub use fixtures::*;
pub use mock_store::MemoryPollStore;
