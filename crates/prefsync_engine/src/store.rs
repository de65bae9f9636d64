//! Store collaborator traits and in-memory implementations.
//!
//! The engine treats both stores as external collaborators: the local
//! store is fast and synchronous, the remote store is a network-backed
//! record store with per-save conflict detection. The in-memory
//! implementations back the test suite and small embeddings, the way a
//! mock transport backs a network engine.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use prefsync_core::{LocalEntry, RemoteRecord, RemoteVersion, SyncKey, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Availability of the remote account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// The account is reachable; sync may run.
    Available,
    /// No account is signed in (or remote access is disabled).
    NoAccount,
    /// Status could not be determined.
    Unknown,
}

impl Default for AccountStatus {
    fn default() -> Self {
        AccountStatus::Available
    }
}

/// Result of a remote save or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The write landed; carries the stored record with its new
    /// version token.
    Saved(RemoteRecord),
    /// The record was deleted.
    Deleted,
    /// The remote changed since the expected version. Carries the
    /// current remote record when the store has it, sparing a refetch.
    VersionConflict(Option<RemoteRecord>),
}

/// The local persistent key-value store.
///
/// Reads and writes are assumed fast and synchronous. The store owns
/// the per-key revision counter: every `set` bumps it, which is how
/// the journal tells an edited value from an unchanged one.
pub trait LocalStore: Send + Sync {
    /// Returns the entry for a key, if present.
    fn get(&self, key: &SyncKey) -> Option<LocalEntry>;

    /// Writes a value and returns the new revision.
    fn set(&self, key: &SyncKey, value: Vec<u8>, modified: Timestamp) -> u64;

    /// Removes a key. Removing an absent key is a no-op.
    fn remove(&self, key: &SyncKey);

    /// Snapshot of every stored entry.
    fn entries(&self) -> Vec<LocalEntry>;
}

/// The remote cloud record store.
///
/// Records are opaque versioned blobs keyed by `SyncKey`. Every
/// successful save replaces the version token; a save against a stale
/// expected version is rejected as `VersionConflict` rather than
/// overwriting.
pub trait RemoteStore: Send + Sync {
    /// Lists the version token of every stored record.
    ///
    /// This is the cheap probe a pass uses to notice writes from other
    /// devices without fetching payloads.
    fn list_versions(&self) -> SyncResult<HashMap<SyncKey, RemoteVersion>>;

    /// Fetches the full record for one key.
    fn fetch(&self, key: &SyncKey) -> SyncResult<Option<RemoteRecord>>;

    /// Saves a value.
    ///
    /// `expected` is the version the caller believes is current;
    /// `None` means the caller believes the record does not exist yet.
    fn save(
        &self,
        key: &SyncKey,
        value: Vec<u8>,
        modified: Timestamp,
        expected: Option<&RemoteVersion>,
    ) -> SyncResult<SaveOutcome>;

    /// Deletes a record, subject to the same version check as `save`.
    fn delete(&self, key: &SyncKey, expected: Option<&RemoteVersion>) -> SyncResult<SaveOutcome>;

    /// Reports account availability.
    fn account_status(&self) -> AccountStatus;
}

/// An in-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: RwLock<HashMap<SyncKey, LocalEntry>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &SyncKey) -> Option<LocalEntry> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &SyncKey, value: Vec<u8>, modified: Timestamp) -> u64 {
        let mut entries = self.entries.write();
        let revision = entries.get(key).map(|e| e.revision + 1).unwrap_or(1);
        entries.insert(
            key.clone(),
            LocalEntry {
                key: key.clone(),
                value,
                revision,
                modified,
            },
        );
        revision
    }

    fn remove(&self, key: &SyncKey) {
        self.entries.write().remove(key);
    }

    fn entries(&self) -> Vec<LocalEntry> {
        self.entries.read().values().cloned().collect()
    }
}

/// An in-memory remote store with scriptable failures.
///
/// Issues version tokens `v1`, `v2`, ... and enforces the expected-
/// version check on save and delete. Tests can script the account
/// status, inject one-shot per-key fetch failures, and read operation
/// counters to assert that no redundant traffic was issued.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    records: RwLock<HashMap<SyncKey, RemoteRecord>>,
    next_version: AtomicU64,
    account: RwLock<AccountStatus>,
    failing_fetches: Mutex<HashSet<SyncKey>>,
    fetch_delay: Mutex<Option<Duration>>,
    seed_before_save: Mutex<Vec<(SyncKey, Vec<u8>, Timestamp)>>,
    drop_account_after_fetch: AtomicBool,
    drop_account_after_list: AtomicBool,
    fetch_count: AtomicU64,
    save_count: AtomicU64,
    delete_count: AtomicU64,
    list_count: AtomicU64,
}

impl MemoryRemoteStore {
    /// Creates an empty store with an available account.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a record directly, bypassing the version check.
    ///
    /// This simulates another device saving through its own engine.
    /// Returns the new version token.
    pub fn seed(
        &self,
        key: impl Into<SyncKey>,
        value: impl Into<Vec<u8>>,
        modified: Timestamp,
    ) -> RemoteVersion {
        let key = key.into();
        let version = self.mint_version();
        self.records.write().insert(
            key.clone(),
            RemoteRecord {
                key,
                value: value.into(),
                version: version.clone(),
                modified,
            },
        );
        version
    }

    /// Removes a record directly, bypassing the version check.
    pub fn seed_delete(&self, key: &SyncKey) {
        self.records.write().remove(key);
    }

    /// Scripts the account status.
    pub fn set_account_status(&self, status: AccountStatus) {
        *self.account.write() = status;
    }

    /// Makes the next fetch of `key` fail with a retryable error.
    pub fn fail_next_fetch(&self, key: impl Into<SyncKey>) {
        self.failing_fetches.lock().insert(key.into());
    }

    /// Makes the next fetch sleep before answering, for exercising
    /// operation timeouts.
    pub fn delay_next_fetch(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    /// Queues a record write that lands just before a save is
    /// processed, for exercising saves rejected by a write that
    /// arrived mid-pass. One queued write is consumed per save.
    pub fn seed_before_next_save(
        &self,
        key: impl Into<SyncKey>,
        value: impl Into<Vec<u8>>,
        modified: Timestamp,
    ) {
        self.seed_before_save
            .lock()
            .push((key.into(), value.into(), modified));
    }

    /// Drops the account to `NoAccount` right after the next fetch
    /// completes, for exercising mid-pass account loss.
    pub fn drop_account_after_next_fetch(&self) {
        self.drop_account_after_fetch.store(true, Ordering::SeqCst);
    }

    /// Drops the account to `NoAccount` right after the next listing,
    /// so the following fetch discovers the outage mid-pass.
    pub fn drop_account_after_next_list(&self) {
        self.drop_account_after_list.store(true, Ordering::SeqCst);
    }

    /// Number of fetches served.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of saves attempted.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Number of deletes attempted.
    pub fn delete_count(&self) -> u64 {
        self.delete_count.load(Ordering::SeqCst)
    }

    /// Number of listings served.
    pub fn list_count(&self) -> u64 {
        self.list_count.load(Ordering::SeqCst)
    }

    /// The current record for a key, if any.
    pub fn record(&self, key: &SyncKey) -> Option<RemoteRecord> {
        self.records.read().get(key).cloned()
    }

    fn mint_version(&self) -> RemoteVersion {
        let n = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        RemoteVersion::new(format!("v{n}"))
    }

    fn ensure_account(&self) -> SyncResult<()> {
        match *self.account.read() {
            AccountStatus::NoAccount => Err(SyncError::AccountUnavailable),
            _ => Ok(()),
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn list_versions(&self) -> SyncResult<HashMap<SyncKey, RemoteVersion>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        self.ensure_account()?;
        let listed = self
            .records
            .read()
            .iter()
            .map(|(k, r)| (k.clone(), r.version.clone()))
            .collect();

        if self.drop_account_after_list.swap(false, Ordering::SeqCst) {
            *self.account.write() = AccountStatus::NoAccount;
        }

        Ok(listed)
    }

    fn fetch(&self, key: &SyncKey) -> SyncResult<Option<RemoteRecord>> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        // Take first so the lock is not held while sleeping.
        let delay = self.fetch_delay.lock().take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.ensure_account()?;

        if self.failing_fetches.lock().remove(key) {
            return Err(SyncError::store_retryable(key.clone(), "injected fetch failure"));
        }

        let record = self.records.read().get(key).cloned();

        if self.drop_account_after_fetch.swap(false, Ordering::SeqCst) {
            *self.account.write() = AccountStatus::NoAccount;
        }

        Ok(record)
    }

    fn save(
        &self,
        key: &SyncKey,
        value: Vec<u8>,
        modified: Timestamp,
        expected: Option<&RemoteVersion>,
    ) -> SyncResult<SaveOutcome> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.ensure_account()?;

        if let Some((key, value, modified)) = {
            let mut queued = self.seed_before_save.lock();
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        } {
            self.seed(key, value, modified);
        }

        let mut records = self.records.write();
        let current = records.get(key);
        if current.map(|r| &r.version) != expected {
            return Ok(SaveOutcome::VersionConflict(current.cloned()));
        }

        let version = self.mint_version();
        let record = RemoteRecord {
            key: key.clone(),
            value,
            version,
            modified,
        };
        records.insert(key.clone(), record.clone());
        Ok(SaveOutcome::Saved(record))
    }

    fn delete(&self, key: &SyncKey, expected: Option<&RemoteVersion>) -> SyncResult<SaveOutcome> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        self.ensure_account()?;

        let mut records = self.records.write();
        let current = records.get(key);
        if current.map(|r| &r.version) != expected {
            return Ok(SaveOutcome::VersionConflict(current.cloned()));
        }

        records.remove(key);
        Ok(SaveOutcome::Deleted)
    }

    fn account_status(&self) -> AccountStatus {
        *self.account.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_store_bumps_revisions() {
        let store = MemoryLocalStore::new();
        let key = SyncKey::new("theme");

        assert_eq!(store.set(&key, b"dark".to_vec(), Timestamp::from_millis(1)), 1);
        assert_eq!(store.set(&key, b"light".to_vec(), Timestamp::from_millis(2)), 2);

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.revision, 2);
        assert_eq!(entry.value, b"light");
    }

    #[test]
    fn local_store_remove_is_idempotent() {
        let store = MemoryLocalStore::new();
        let key = SyncKey::new("theme");
        store.set(&key, b"dark".to_vec(), Timestamp::from_millis(1));
        store.remove(&key);
        store.remove(&key);
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remote_save_mints_fresh_versions() {
        let store = MemoryRemoteStore::new();
        let key = SyncKey::new("theme");

        let outcome = store
            .save(&key, b"dark".to_vec(), Timestamp::from_millis(1), None)
            .unwrap();
        let first = match outcome {
            SaveOutcome::Saved(record) => record.version,
            other => panic!("unexpected outcome {other:?}"),
        };

        let outcome = store
            .save(&key, b"light".to_vec(), Timestamp::from_millis(2), Some(&first))
            .unwrap();
        match outcome {
            SaveOutcome::Saved(record) => assert_ne!(record.version, first),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn stale_save_reports_version_conflict_with_current_record() {
        let store = MemoryRemoteStore::new();
        let key = SyncKey::new("theme");
        let stale = store.seed("theme", b"dark".to_vec(), Timestamp::from_millis(1));
        store.seed("theme", b"light".to_vec(), Timestamp::from_millis(2));

        let outcome = store
            .save(&key, b"darker".to_vec(), Timestamp::from_millis(3), Some(&stale))
            .unwrap();
        match outcome {
            SaveOutcome::VersionConflict(Some(current)) => {
                assert_eq!(current.value, b"light");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn save_against_missing_record_requires_no_expected_version() {
        let store = MemoryRemoteStore::new();
        let key = SyncKey::new("theme");
        let stale = RemoteVersion::new("v9");

        let outcome = store
            .save(&key, b"dark".to_vec(), Timestamp::from_millis(1), Some(&stale))
            .unwrap();
        assert_eq!(outcome, SaveOutcome::VersionConflict(None));
    }

    #[test]
    fn delete_honors_version_check() {
        let store = MemoryRemoteStore::new();
        let key = SyncKey::new("theme");
        let version = store.seed("theme", b"dark".to_vec(), Timestamp::from_millis(1));

        let outcome = store.delete(&key, Some(&RemoteVersion::new("v999"))).unwrap();
        assert!(matches!(outcome, SaveOutcome::VersionConflict(Some(_))));

        let outcome = store.delete(&key, Some(&version)).unwrap();
        assert_eq!(outcome, SaveOutcome::Deleted);
        assert!(store.record(&key).is_none());
    }

    #[test]
    fn injected_fetch_failure_is_one_shot() {
        let store = MemoryRemoteStore::new();
        let key = SyncKey::new("theme");
        store.seed("theme", b"dark".to_vec(), Timestamp::from_millis(1));
        store.fail_next_fetch("theme");

        assert!(store.fetch(&key).is_err());
        assert!(store.fetch(&key).unwrap().is_some());
    }

    #[test]
    fn no_account_rejects_operations() {
        let store = MemoryRemoteStore::new();
        store.set_account_status(AccountStatus::NoAccount);

        let key = SyncKey::new("theme");
        assert!(matches!(
            store.fetch(&key),
            Err(SyncError::AccountUnavailable)
        ));
        assert!(matches!(
            store.list_versions(),
            Err(SyncError::AccountUnavailable)
        ));
    }

    #[test]
    fn account_drop_after_fetch() {
        let store = MemoryRemoteStore::new();
        store.seed("theme", b"dark".to_vec(), Timestamp::from_millis(1));
        store.drop_account_after_next_fetch();

        let key = SyncKey::new("theme");
        assert!(store.fetch(&key).is_ok());
        assert_eq!(store.account_status(), AccountStatus::NoAccount);
    }
}
