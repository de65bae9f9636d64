//! Conflict resolution: which side of a concurrent edit wins.

use crate::journal::JournalEntry;
use crate::record::{LocalEntry, RemoteRecord};
use std::fmt;
use std::sync::Arc;

/// The result of conflict resolution for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The local side wins: queue a remote save (or a remote delete
    /// when the local side is absent). Byte-equal values also yield
    /// `UseLocal`; the coordinator recognizes that case and issues no
    /// write at all.
    UseLocal,
    /// The remote side wins: write the remote value locally (or remove
    /// the local value when the remote side is absent).
    UseRemote,
    /// A host merge hook produced a combined value: write it locally
    /// and save it remotely.
    Merge(Vec<u8>),
    /// Neither side can be ordered. Surfaced to the host, never
    /// silently dropped.
    Conflict,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::UseLocal => f.write_str("use-local"),
            Outcome::UseRemote => f.write_str("use-remote"),
            Outcome::Merge(_) => f.write_str("merge"),
            Outcome::Conflict => f.write_str("conflict"),
        }
    }
}

/// A host-supplied merge hook for ambiguous edits.
///
/// Called only when both sides are present, differ, and cannot be
/// ordered by timestamp. Returning `None` declines the merge and the
/// outcome becomes `Conflict`.
pub type MergeFn = dyn Fn(&LocalEntry, &RemoteRecord) -> Option<Vec<u8>> + Send + Sync;

/// Decides the winner between a local value and a remote value.
///
/// The policy is last-writer-wins with explicit ties surfaced: the
/// common no-concurrent-edit case resolves automatically, while an
/// ambiguous pair is reported as a conflict rather than guessed at.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    merge_fn: Option<Arc<MergeFn>>,
}

impl ConflictResolver {
    /// Creates a resolver with no merge hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a merge hook consulted before declaring a conflict.
    pub fn with_merge_fn(merge_fn: Arc<MergeFn>) -> Self {
        Self {
            merge_fn: Some(merge_fn),
        }
    }

    /// Resolves one key.
    ///
    /// `last_synced` is the journal entry for the key, if any; it is
    /// what distinguishes "never existed on that side" from "was
    /// deleted on that side".
    ///
    /// Policy, in order:
    /// 1. One side absent: with no journal entry the present side wins
    ///    (first-sync population). With a journal entry the absence is
    ///    a deletion; it wins if the surviving side is unchanged since
    ///    last sync, and conflicts otherwise (update vs delete).
    /// 2. Byte-equal values are a no-op (`UseLocal`).
    /// 3. The strictly newer reliable timestamp wins.
    /// 4. Equal or unreliable timestamps: try the merge hook, else
    ///    `Conflict`.
    pub fn resolve(
        &self,
        local: Option<&LocalEntry>,
        remote: Option<&RemoteRecord>,
        last_synced: Option<&JournalEntry>,
    ) -> Outcome {
        match (local, remote) {
            (None, None) => Outcome::UseLocal,
            (Some(local_entry), None) => match last_synced {
                // Never synced: first-sync population toward remote.
                None => Outcome::UseLocal,
                Some(journaled) => {
                    if journaled.local_revision == local_entry.revision {
                        // Local unchanged since last sync; the remote
                        // deletion is the newer edit.
                        Outcome::UseRemote
                    } else {
                        // Local edited, remote deleted: update vs delete.
                        Outcome::Conflict
                    }
                }
            },
            (None, Some(record)) => match last_synced {
                None => Outcome::UseRemote,
                Some(journaled) => {
                    if journaled.remote_version == record.version {
                        // Remote unchanged since last sync; the local
                        // deletion propagates.
                        Outcome::UseLocal
                    } else {
                        Outcome::Conflict
                    }
                }
            },
            (Some(local_entry), Some(record)) => {
                if local_entry.value == record.value {
                    return Outcome::UseLocal;
                }
                if local_entry.modified.is_reliable()
                    && record.modified.is_reliable()
                    && local_entry.modified != record.modified
                {
                    return if local_entry.modified > record.modified {
                        Outcome::UseLocal
                    } else {
                        Outcome::UseRemote
                    };
                }
                if let Some(merge) = &self.merge_fn {
                    if let Some(value) = merge(local_entry, record) {
                        return Outcome::Merge(value);
                    }
                }
                Outcome::Conflict
            }
        }
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("merge_fn", &self.merge_fn.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Timestamp;
    use crate::record::RemoteVersion;
    use proptest::prelude::*;

    fn local(value: &[u8], revision: u64, millis: u64) -> LocalEntry {
        LocalEntry::new("theme", value.to_vec(), revision, Timestamp::from_millis(millis))
    }

    fn remote(value: &[u8], version: &str, millis: u64) -> RemoteRecord {
        RemoteRecord::new(
            "theme",
            value.to_vec(),
            RemoteVersion::new(version),
            Timestamp::from_millis(millis),
        )
    }

    fn journaled(revision: u64, version: &str) -> JournalEntry {
        JournalEntry {
            local_revision: revision,
            remote_version: RemoteVersion::new(version),
        }
    }

    #[test]
    fn local_only_first_sync_wins_local() {
        let resolver = ConflictResolver::new();
        let entry = local(b"dark", 1, 10);
        assert_eq!(resolver.resolve(Some(&entry), None, None), Outcome::UseLocal);
    }

    #[test]
    fn remote_only_first_sync_wins_remote() {
        let resolver = ConflictResolver::new();
        let record = remote(b"light", "v1", 10);
        assert_eq!(resolver.resolve(None, Some(&record), None), Outcome::UseRemote);
    }

    #[test]
    fn byte_equal_values_are_a_noop() {
        let resolver = ConflictResolver::new();
        let entry = local(b"dark", 2, 10);
        let record = remote(b"dark", "v1", 99);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::UseLocal
        );
    }

    #[test]
    fn newer_timestamp_wins_either_side() {
        let resolver = ConflictResolver::new();

        let entry = local(b"dark", 1, 20);
        let record = remote(b"light", "v1", 10);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::UseLocal
        );

        let entry = local(b"dark", 1, 10);
        let record = remote(b"light", "v1", 20);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::UseRemote
        );
    }

    #[test]
    fn equal_timestamps_conflict() {
        let resolver = ConflictResolver::new();
        let entry = local(b"dark", 1, 10);
        let record = remote(b"light", "v1", 10);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::Conflict
        );
    }

    #[test]
    fn unreliable_timestamp_conflicts() {
        let resolver = ConflictResolver::new();
        let entry = local(b"dark", 1, 0);
        let record = remote(b"light", "v1", 20);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::Conflict
        );
    }

    #[test]
    fn merge_hook_breaks_ties() {
        let resolver = ConflictResolver::with_merge_fn(Arc::new(|l, r| {
            let mut merged = l.value.clone();
            merged.extend_from_slice(&r.value);
            Some(merged)
        }));
        let entry = local(b"dark", 1, 10);
        let record = remote(b"light", "v1", 10);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::Merge(b"darklight".to_vec())
        );
    }

    #[test]
    fn declined_merge_stays_a_conflict() {
        let resolver = ConflictResolver::with_merge_fn(Arc::new(|_, _| None));
        let entry = local(b"dark", 1, 10);
        let record = remote(b"light", "v1", 10);
        assert_eq!(
            resolver.resolve(Some(&entry), Some(&record), None),
            Outcome::Conflict
        );
    }

    #[test]
    fn local_deletion_propagates_when_remote_unchanged() {
        let resolver = ConflictResolver::new();
        let record = remote(b"dark", "v1", 10);
        let journal = journaled(1, "v1");
        assert_eq!(
            resolver.resolve(None, Some(&record), Some(&journal)),
            Outcome::UseLocal
        );
    }

    #[test]
    fn local_deletion_against_remote_edit_conflicts() {
        let resolver = ConflictResolver::new();
        let record = remote(b"light", "v2", 20);
        let journal = journaled(1, "v1");
        assert_eq!(
            resolver.resolve(None, Some(&record), Some(&journal)),
            Outcome::Conflict
        );
    }

    #[test]
    fn remote_deletion_propagates_when_local_unchanged() {
        let resolver = ConflictResolver::new();
        let entry = local(b"dark", 1, 10);
        let journal = journaled(1, "v1");
        assert_eq!(
            resolver.resolve(Some(&entry), None, Some(&journal)),
            Outcome::UseRemote
        );
    }

    #[test]
    fn remote_deletion_against_local_edit_conflicts() {
        let resolver = ConflictResolver::new();
        let entry = local(b"darker", 2, 30);
        let journal = journaled(1, "v1");
        assert_eq!(
            resolver.resolve(Some(&entry), None, Some(&journal)),
            Outcome::Conflict
        );
    }

    proptest! {
        // Distinct reliable timestamps with both sides present never
        // surface a conflict; the engine stays fully automatic in the
        // no-tie case.
        #[test]
        fn distinct_timestamps_never_conflict(
            lv in proptest::collection::vec(any::<u8>(), 0..16),
            rv in proptest::collection::vec(any::<u8>(), 0..16),
            lt in 1u64..1_000_000,
            rt in 1u64..1_000_000,
        ) {
            prop_assume!(lt != rt);
            let resolver = ConflictResolver::new();
            let entry = local(&lv, 1, lt);
            let record = remote(&rv, "v1", rt);
            let outcome = resolver.resolve(Some(&entry), Some(&record), None);
            prop_assert_ne!(outcome, Outcome::Conflict);
        }

        // The winner is determined by the timestamps alone, never by
        // which side happens to hold the value.
        #[test]
        fn winner_follows_the_later_timestamp(
            lt in 1u64..1_000_000,
            rt in 1u64..1_000_000,
        ) {
            prop_assume!(lt != rt);
            let resolver = ConflictResolver::new();
            let entry = local(b"a", 1, lt);
            let record = remote(b"b", "v1", rt);
            let outcome = resolver.resolve(Some(&entry), Some(&record), None);
            if lt > rt {
                prop_assert_eq!(outcome, Outcome::UseLocal);
            } else {
                prop_assert_eq!(outcome, Outcome::UseRemote);
            }
        }
    }
}
