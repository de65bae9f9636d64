//! Local and remote record types plus notification payloads.

use crate::key::{SyncKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value as held by the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// The key.
    pub key: SyncKey,
    /// Opaque serialized payload.
    pub value: Vec<u8>,
    /// Monotonic per-key revision counter, bumped on every local set.
    pub revision: u64,
    /// When the value was last modified locally.
    pub modified: Timestamp,
}

impl LocalEntry {
    /// Creates a local entry.
    pub fn new(
        key: impl Into<SyncKey>,
        value: impl Into<Vec<u8>>,
        revision: u64,
        modified: Timestamp,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            revision,
            modified,
        }
    }
}

/// An opaque version token issued by the remote store.
///
/// Tokens are only ever compared for equality; their content carries
/// no meaning to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteVersion(String);

impl RemoteVersion {
    /// Wraps a store-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as held by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// The key.
    pub key: SyncKey,
    /// Opaque serialized payload.
    pub value: Vec<u8>,
    /// Store-issued version token, replaced on every successful save.
    pub version: RemoteVersion,
    /// When the record was last modified remotely.
    pub modified: Timestamp,
}

impl RemoteRecord {
    /// Creates a remote record.
    pub fn new(
        key: impl Into<SyncKey>,
        value: impl Into<Vec<u8>>,
        version: RemoteVersion,
        modified: Timestamp,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            modified,
        }
    }
}

/// Both sides of an unresolved conflict.
///
/// Always carries both competing values so the host can present a
/// resolution UI. `None` on one side means that side deleted the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The conflicted key.
    pub key: SyncKey,
    /// The local side, if present.
    pub local: Option<LocalEntry>,
    /// The remote side, if present.
    pub remote: Option<RemoteRecord>,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
}

/// The three notification categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// Keys whose local value changed because of a remote edit.
    Changes,
    /// Conflicts that could not be resolved automatically.
    Conflicts,
    /// Keys whose local value was saved to the remote store.
    SaveSuccess,
}

/// A notification payload published after a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Local values updated from remote state.
    Changes {
        /// The keys that changed.
        keys: Vec<SyncKey>,
    },
    /// Conflicts surfaced for host resolution.
    Conflicts {
        /// The conflicts, with both competing values each.
        records: Vec<ConflictRecord>,
    },
    /// Local values successfully saved remotely.
    SaveSuccess {
        /// The keys that were saved.
        keys: Vec<SyncKey>,
    },
}

impl Notification {
    /// The category this payload belongs to.
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Notification::Changes { .. } => NotificationType::Changes,
            Notification::Conflicts { .. } => NotificationType::Conflicts,
            Notification::SaveSuccess { .. } => NotificationType::SaveSuccess,
        }
    }

    /// Returns true if the payload carries nothing worth publishing.
    pub fn is_empty(&self) -> bool {
        match self {
            Notification::Changes { keys } => keys.is_empty(),
            Notification::Conflicts { records } => records.is_empty(),
            Notification::SaveSuccess { keys } => keys.is_empty(),
        }
    }
}
