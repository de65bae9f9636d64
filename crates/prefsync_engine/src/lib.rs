//! # prefsync engine
//!
//! Coordination engine keeping a local key-value store synchronized
//! with a remote, eventually-consistent cloud record store across the
//! devices of one account.
//!
//! This crate provides:
//! - `LocalStore` / `RemoteStore` collaborator traits with in-memory
//!   implementations
//! - `AccountMonitor` gating passes on account availability
//! - `NotificationHub` for changes / conflicts / save-success events
//! - `SyncCoordinator`, the pass state machine and command surface
//!
//! ## Architecture
//!
//! A pass walks `Idle → Checking → Fetching → Resolving → Applying →
//! Saving → Idle`, with `AccountUnavailable` reachable from any state.
//! Reconciliation per key is delegated to `prefsync_core`'s
//! `ConflictResolver` over the `ChangeJournal`'s view of what changed
//! since the last sync.
//!
//! ## Key invariants
//!
//! - One pass at a time; extra triggers coalesce into one follow-up.
//! - At most one outgoing remote write in flight per key.
//! - The journal advances key-by-key on terminal success only.
//! - Per-key failures are isolated; only account loss aborts a pass.
//! - A local edit is never dropped silently: ambiguous pairs surface
//!   as conflicts carrying both values.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod account;
mod config;
mod coordinator;
mod error;
mod notify;
mod store;

pub use account::{AccountCheck, AccountDelegate, AccountMonitor};
pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{
    CheckOutcome, PassReport, SkippedKey, SyncCoordinator, SyncState, SyncStats,
};
pub use error::{SyncError, SyncResult};
pub use notify::{NotificationCallback, NotificationHub, SubscriptionToken};
pub use store::{
    AccountStatus, LocalStore, MemoryLocalStore, MemoryRemoteStore, RemoteStore, SaveOutcome,
};

pub use prefsync_core::{
    ChangeJournal, ConflictRecord, ConflictResolver, JournalEntry, KeyFilter, LocalEntry,
    MergeFn, Notification, NotificationType, Outcome, RemoteRecord, RemoteVersion, ScopeRule,
    SyncKey, Timestamp,
};
