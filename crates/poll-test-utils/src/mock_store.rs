//! In-memory [`PollStore`] for durable-mode testing.
//!
//! Mirrors the Redis store's rules:
//! - A save that is not newer than the stored version is rejected as `Storage`
//! - Deletes are owner-checked
//! - The owner and public listings follow saves and deletes
//!
//! Failures and latency can be injected to exercise write-through paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use poll_test_utils::MemoryPollStore;
//!
//! let store = MemoryPollStore::new();
//! store.fail_saves(true);
//! // create_poll now fails with Storage and nothing is left behind
//! ```

use async_trait::async_trait;
use common::types::{SessionCode, VoterIdentity};
use poll_service::errors::PollError;
use poll_service::storage::{DeleteOutcome, PollRecord, PollStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory poll store with failure injection and call counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryPollStore {
    inner: Arc<MemoryPollStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryPollStoreInner {
    records: Mutex<HashMap<SessionCode, PollRecord>>,
    save_delay: Mutex<Option<Duration>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
    loads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryPollStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a record.
    #[must_use]
    pub fn with_record(self, record: PollRecord) -> Self {
        self.inner
            .records
            .lock()
            .unwrap()
            .insert(record.session_code.clone(), record);
        self
    }

    /// Make every save fail with `Storage` until turned off.
    pub fn fail_saves(&self, fail: bool) {
        self.inner.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every load and list fail with `Storage` until turned off.
    pub fn fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Delay every save, to push votes past their operation timeout.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.inner.save_delay.lock().unwrap() = delay;
    }

    /// The stored record for `code`.
    pub fn get(&self, code: &SessionCode) -> Option<PollRecord> {
        self.inner.records.lock().unwrap().get(code).cloned()
    }

    /// Number of stored polls.
    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    /// Whether the store holds no polls.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Load calls so far, successful or not.
    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    /// Successful deletes so far.
    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// Shared handle for `PollServiceBuilder::store`.
    pub fn shared(&self) -> Arc<dyn PollStore> {
        Arc::new(self.clone())
    }

    fn list_where(&self, keep: impl Fn(&PollRecord) -> bool) -> Result<Vec<PollRecord>, PollError> {
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(PollError::Storage("injected load failure".to_string()));
        }
        Ok(self
            .inner
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| keep(record))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn save(&self, record: &PollRecord) -> Result<(), PollError> {
        let delay = *self.inner.save_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_saves.load(Ordering::SeqCst) {
            return Err(PollError::Storage("injected save failure".to_string()));
        }

        let mut records = self.inner.records.lock().unwrap();
        if let Some(current) = records.get(&record.session_code) {
            if record.version <= current.version {
                return Err(PollError::Storage("stale poll version".to_string()));
            }
        }
        records.insert(record.session_code.clone(), record.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, code: &SessionCode) -> Result<Option<PollRecord>, PollError> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(PollError::Storage("injected load failure".to_string()));
        }
        Ok(self.get(code))
    }

    async fn delete_by_owner(
        &self,
        code: &SessionCode,
        owner: &VoterIdentity,
    ) -> Result<DeleteOutcome, PollError> {
        let mut records = self.inner.records.lock().unwrap();
        match records.get(code) {
            None => Ok(DeleteOutcome::NotFound),
            Some(record) if &record.created_by != owner => Ok(DeleteOutcome::NotOwner),
            Some(_) => {
                records.remove(code);
                self.inner.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn list_by_owner(&self, owner: &VoterIdentity) -> Result<Vec<PollRecord>, PollError> {
        self.list_where(|record| &record.created_by == owner)
    }

    async fn list_public(&self) -> Result<Vec<PollRecord>, PollError> {
        self.list_where(|record| record.is_public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{account, coffee_or_tea};
    use chrono::Utc;
    use poll_service::ledger::VoteLedger;

    fn record(code: &str, owner: &str) -> PollRecord {
        let code = SessionCode::parse(code).unwrap();
        VoteLedger::new(code, coffee_or_tea(account(owner)), Utc::now()).to_record()
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryPollStore::new();
        let record = record("AB23CD", "alice");

        store.save(&record).await.unwrap();

        assert_eq!(store.load(&record.session_code).await.unwrap(), Some(record));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_save_rejected() {
        let store = MemoryPollStore::new();
        let mut newer = record("AB23CD", "alice");
        newer.version = 3;
        store.save(&newer).await.unwrap();

        let mut older = newer.clone();
        older.version = 2;
        assert!(matches!(
            store.save(&older).await,
            Err(PollError::Storage(_))
        ));

        // Two writers with the same version cannot both win
        let mut same = newer.clone();
        same.tally = vec![0, 1];
        assert!(matches!(
            store.save(&same).await,
            Err(PollError::Storage(_))
        ));

        let stored = store.get(&newer.session_code).unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.tally, newer.tally);
    }

    #[tokio::test]
    async fn test_delete_checks_owner() {
        let store = MemoryPollStore::new().with_record(record("AB23CD", "alice"));
        let code = SessionCode::parse("AB23CD").unwrap();

        assert_eq!(
            store.delete_by_owner(&code, &account("mallory")).await.unwrap(),
            DeleteOutcome::NotOwner
        );
        assert_eq!(
            store.delete_by_owner(&code, &account("alice")).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            store.delete_by_owner(&code, &account("alice")).await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_list_by_owner_filters() {
        let store = MemoryPollStore::new()
            .with_record(record("AB23CD", "alice"))
            .with_record(record("XY7ZAB", "bob"));

        let listed = store.list_by_owner(&account("alice")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_code.as_str(), "AB23CD");
    }

    #[tokio::test]
    async fn test_list_public_skips_private_polls() {
        let mut hidden = record("XY7ZAB", "bob");
        hidden.is_public = false;
        let store = MemoryPollStore::new()
            .with_record(record("AB23CD", "alice"))
            .with_record(hidden);

        let listed = store.list_public().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_code.as_str(), "AB23CD");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryPollStore::new();
        store.fail_saves(true);
        assert!(store.save(&record("AB23CD", "alice")).await.is_err());
        assert!(store.is_empty());

        store.fail_loads(true);
        let code = SessionCode::parse("AB23CD").unwrap();
        assert!(store.load(&code).await.is_err());
        assert_eq!(store.load_count(), 1);
    }
}
