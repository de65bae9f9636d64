//! Error types for the sync engine.

use prefsync_core::SyncKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    /// The remote account is not available; the pass aborts.
    #[error("remote account unavailable")]
    AccountUnavailable,

    /// A store operation for a single key failed.
    #[error("store error for key {key}: {message}")]
    Store {
        /// The affected key.
        key: SyncKey,
        /// Error message.
        message: String,
        /// Whether the operation can be retried on the next pass.
        retryable: bool,
    },

    /// Listing remote state failed before any key was examined.
    #[error("remote listing failed: {0}")]
    RemoteListing(String),

    /// A remote save kept hitting concurrent modifications until the
    /// retry budget ran out; escalated to a conflict.
    #[error("version conflict retries exhausted for key {key}")]
    VersionConflictExhausted {
        /// The affected key.
        key: SyncKey,
    },

    /// The pass was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// A remote operation timed out.
    #[error("remote operation timed out for key {key}")]
    Timeout {
        /// The affected key.
        key: SyncKey,
    },
}

impl SyncError {
    /// Creates a retryable per-key store error.
    pub fn store_retryable(key: SyncKey, message: impl Into<String>) -> Self {
        Self::Store {
            key,
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable per-key store error.
    pub fn store_fatal(key: SyncKey, message: impl Into<String>) -> Self {
        Self::Store {
            key,
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the operation can be retried on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store { retryable, .. } => *retryable,
            SyncError::Timeout { .. } => true,
            SyncError::RemoteListing(_) => true,
            SyncError::AccountUnavailable => true,
            _ => false,
        }
    }

    /// The key this error is scoped to, if it is a per-key error.
    pub fn key(&self) -> Option<&SyncKey> {
        match self {
            SyncError::Store { key, .. }
            | SyncError::VersionConflictExhausted { key }
            | SyncError::Timeout { key } => Some(key),
            _ => None,
        }
    }
}
