//! Change journal: the last known synchronized state per key.

use crate::filter::KeyFilter;
use crate::key::SyncKey;
use crate::record::{LocalEntry, RemoteVersion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The last state known to be equal on both sides for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Local revision at the last successful reconciliation.
    pub local_revision: u64,
    /// Remote version at the last successful reconciliation.
    pub remote_version: RemoteVersion,
}

/// Tracks, per key, the last synchronized local revision and remote
/// version. The journal is the source of truth for "what changed
/// since last sync."
///
/// # Invariants
///
/// - An entry's revisions always reflect a state that was, at some
///   point, equal on both sides.
/// - Entries are updated key-by-key on terminal success only, never
///   bulk-committed, so an aborted pass leaves the journal at its
///   pre-pass state for every key that did not finish.
/// - Every journaled key is in scope; `prune` enforces this on scope
///   changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeJournal {
    entries: HashMap<SyncKey, JournalEntry>,
}

impl ChangeJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the set of keys needing reconciliation.
    ///
    /// A key is flagged when its current local revision differs from
    /// the journal's last synced revision, or when the remote version
    /// seen this pass differs from the journal's last synced remote
    /// version. The double condition is what detects remote-only
    /// changes (another device wrote) as well as local-only ones.
    ///
    /// Keys present in the journal but absent from both snapshots are
    /// also flagged, so double deletions get their entries retired.
    pub fn diff(
        &self,
        local: &[LocalEntry],
        remote_versions: &HashMap<SyncKey, Option<RemoteVersion>>,
    ) -> BTreeSet<SyncKey> {
        let mut flagged = BTreeSet::new();

        for entry in local {
            match self.entries.get(&entry.key) {
                Some(journaled) if journaled.local_revision == entry.revision => {}
                _ => {
                    flagged.insert(entry.key.clone());
                }
            }
        }

        for (key, version) in remote_versions {
            match (self.entries.get(key), version) {
                (Some(journaled), Some(version)) if journaled.remote_version == *version => {}
                (None, None) => {}
                _ => {
                    flagged.insert(key.clone());
                }
            }
        }

        // A journaled key missing from the local snapshot is a local
        // deletion (or a double deletion); either way it needs a
        // terminal outcome.
        let local_keys: BTreeSet<&SyncKey> = local.iter().map(|e| &e.key).collect();
        for key in self.entries.keys() {
            if !local_keys.contains(key) {
                flagged.insert(key.clone());
            }
        }

        flagged
    }

    /// Records a successful reconciliation for one key.
    pub fn record_synced(&mut self, key: SyncKey, local_revision: u64, remote_version: RemoteVersion) {
        self.entries.insert(
            key,
            JournalEntry {
                local_revision,
                remote_version,
            },
        );
    }

    /// Removes one entry (the key was deleted on both sides).
    pub fn forget(&mut self, key: &SyncKey) -> Option<JournalEntry> {
        self.entries.remove(key)
    }

    /// Drops entries whose key is no longer in scope.
    ///
    /// Returns the pruned keys. Entries for keys still in scope are
    /// untouched.
    pub fn prune(&mut self, filter: &KeyFilter) -> Vec<SyncKey> {
        let stale: Vec<SyncKey> = self
            .entries
            .keys()
            .filter(|key| !filter.matches(key))
            .cloned()
            .collect();
        for key in &stale {
            self.entries.remove(key);
        }
        stale
    }

    /// The journal entry for a key, if one exists.
    pub fn get(&self, key: &SyncKey) -> Option<&JournalEntry> {
        self.entries.get(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over journaled keys.
    pub fn keys(&self) -> impl Iterator<Item = &SyncKey> {
        self.entries.keys()
    }
}
