//! Key and timestamp newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A key tracked for synchronization.
///
/// Keys are plain strings, unique within a scope and immutable once
/// created. Ordering is lexicographic, which gives every pass a
/// deterministic key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncKey(String);

impl SyncKey {
    /// Creates a key from anything string-like.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SyncKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A modification timestamp in milliseconds since the Unix epoch.
///
/// A zero timestamp means the origin of the value is unknown; it is
/// treated as unreliable and never wins a timestamp comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The unreliable zero timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns true if this timestamp can be used for ordering.
    pub const fn is_reliable(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = SyncKey::new("alpha");
        let b = SyncKey::new("beta");
        assert!(a < b);
        assert_eq!(a.as_str(), "alpha");
    }

    #[test]
    fn zero_timestamp_is_unreliable() {
        assert!(!Timestamp::ZERO.is_reliable());
        assert!(Timestamp::from_millis(1).is_reliable());
    }

    #[test]
    fn now_is_nonzero() {
        assert!(Timestamp::now().is_reliable());
    }

    #[test]
    fn serde_transparent() {
        let key = SyncKey::new("theme");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"theme\"");

        let ts = Timestamp::from_millis(42);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "42");
    }
}
