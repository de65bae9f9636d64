//! # prefsync core
//!
//! Data model and reconciliation logic for prefsync.
//!
//! This crate provides:
//! - `SyncKey` and `Timestamp` newtypes
//! - `KeyFilter` for scoping which keys are synchronized
//! - `ChangeJournal` for tracking the last synchronized state per key
//! - `ConflictResolver` for deciding which side of a concurrent edit wins
//! - Record and notification payload types
//!
//! This is a pure crate with no I/O operations. The sync state machine
//! and store collaborators live in `prefsync_engine`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod filter;
mod journal;
mod key;
mod record;
mod resolver;

pub use filter::{KeyFilter, ScopeRule};
pub use journal::{ChangeJournal, JournalEntry};
pub use key::{SyncKey, Timestamp};
pub use record::{
    ConflictRecord, LocalEntry, Notification, NotificationType, RemoteRecord, RemoteVersion,
};
pub use resolver::{ConflictResolver, MergeFn, Outcome};
