//! Key scope filtering.

use crate::key::SyncKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single scope rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScopeRule {
    /// Matches every key starting with the prefix.
    Prefix(String),
    /// Matches exactly one key.
    Exact(String),
}

impl ScopeRule {
    /// Returns true if the rule matches the key.
    pub fn matches(&self, key: &SyncKey) -> bool {
        match self {
            ScopeRule::Prefix(prefix) => key.as_str().starts_with(prefix.as_str()),
            ScopeRule::Exact(exact) => key.as_str() == exact.as_str(),
        }
    }
}

/// Decides which keys are in scope for synchronization.
///
/// The filter holds an active rule set. A key is in scope when any
/// active rule matches it. `install` atomically replaces the whole
/// set (re-start semantics), while `remove` drops only the named
/// rules, leaving the rest active (stop-for-key-match-list semantics).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    rules: BTreeSet<ScopeRule>,
}

impl KeyFilter {
    /// Creates an empty filter. Nothing is in scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter with a single prefix rule.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let mut filter = Self::new();
        filter.install([ScopeRule::Prefix(prefix.into())]);
        filter
    }

    /// Creates a filter from an explicit key match list.
    pub fn with_key_match_list<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = Self::new();
        filter.install(keys.into_iter().map(|k| ScopeRule::Exact(k.into())));
        filter
    }

    /// Returns true if the key is in scope.
    pub fn matches(&self, key: &SyncKey) -> bool {
        self.rules.iter().any(|rule| rule.matches(key))
    }

    /// Atomically replaces the active rule set.
    ///
    /// Installing an identical set is a no-op, so repeated starts with
    /// the same scope are idempotent.
    pub fn install<I>(&mut self, rules: I)
    where
        I: IntoIterator<Item = ScopeRule>,
    {
        self.rules = rules.into_iter().collect();
    }

    /// Adds rules to the active set without disturbing existing ones.
    pub fn add<I>(&mut self, rules: I)
    where
        I: IntoIterator<Item = ScopeRule>,
    {
        self.rules.extend(rules);
    }

    /// Removes specific rules from the active set.
    ///
    /// Rules not named are untouched. Returns how many rules were
    /// actually removed.
    pub fn remove<'a, I>(&mut self, rules: I) -> usize
    where
        I: IntoIterator<Item = &'a ScopeRule>,
    {
        rules.into_iter().filter(|rule| self.rules.remove(*rule)).count()
    }

    /// Removes every rule. Nothing is in scope afterwards.
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Returns true if no rules are installed.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of active rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Iterates over the active rules.
    pub fn rules(&self) -> impl Iterator<Item = &ScopeRule> {
        self.rules.iter()
    }
}
