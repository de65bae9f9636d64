//! Account availability monitoring.

use crate::store::{AccountStatus, RemoteStore};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Host callback for account loss.
///
/// Mirrors the classic no-account delegate: invoked when the engine
/// discovers that remote access is gone (not signed in, remote storage
/// disabled, and so on).
pub trait AccountDelegate: Send + Sync {
    /// Called once per transition into `NoAccount`.
    fn account_unavailable(&self);
}

/// Outcome of one account check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountCheck {
    /// The status observed by this check.
    pub status: AccountStatus,
    /// True only on the transition into `NoAccount`. Repeated checks
    /// while the account stays unavailable report `false`, so the
    /// no-account notification fires exactly once per outage.
    pub became_unavailable: bool,
}

/// Observes remote account availability and reports loss of access.
///
/// The delegate is held weakly: the monitor never extends the
/// delegate's lifetime, and a delegate dropped without unregistering
/// is simply skipped.
pub struct AccountMonitor {
    remote: Arc<dyn RemoteStore>,
    last_status: Mutex<AccountStatus>,
    delegate: Mutex<Option<Weak<dyn AccountDelegate>>>,
}

impl AccountMonitor {
    /// Creates a monitor over a remote store.
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            last_status: Mutex::new(AccountStatus::Unknown),
            delegate: Mutex::new(None),
        }
    }

    /// Registers the no-account delegate, replacing any previous one.
    pub fn set_delegate(&self, delegate: &Arc<dyn AccountDelegate>) {
        *self.delegate.lock() = Some(Arc::downgrade(delegate));
    }

    /// Removes the delegate.
    pub fn clear_delegate(&self) {
        *self.delegate.lock() = None;
    }

    /// The status observed by the most recent check.
    pub fn last_status(&self) -> AccountStatus {
        *self.last_status.lock()
    }

    /// Queries the remote store and latches transitions.
    ///
    /// On the transition into `NoAccount` the delegate is invoked;
    /// further checks while still unavailable do not re-notify.
    pub fn check(&self) -> AccountCheck {
        let status = self.remote.account_status();
        let mut last = self.last_status.lock();
        let became_unavailable =
            status == AccountStatus::NoAccount && *last != AccountStatus::NoAccount;
        let recovered = status == AccountStatus::Available && *last == AccountStatus::NoAccount;
        *last = status;
        drop(last);

        if became_unavailable {
            warn!("remote account became unavailable");
            self.notify_delegate();
        } else if recovered {
            debug!("remote account access restored");
        }

        AccountCheck {
            status,
            became_unavailable,
        }
    }

    fn notify_delegate(&self) {
        let delegate = self.delegate.lock().as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            delegate.account_unavailable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRemoteStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDelegate {
        calls: AtomicU32,
    }

    impl AccountDelegate for CountingDelegate {
        fn account_unavailable(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn transition_fires_delegate_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = AccountMonitor::new(remote.clone());
        let delegate = Arc::new(CountingDelegate {
            calls: AtomicU32::new(0),
        });
        let handle: Arc<dyn AccountDelegate> = delegate.clone();
        monitor.set_delegate(&handle);

        assert_eq!(monitor.check().status, AccountStatus::Available);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 0);

        remote.set_account_status(AccountStatus::NoAccount);
        assert!(monitor.check().became_unavailable);
        assert!(!monitor.check().became_unavailable);
        assert!(!monitor.check().became_unavailable);
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outage_renotifies_after_recovery() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = AccountMonitor::new(remote.clone());

        remote.set_account_status(AccountStatus::NoAccount);
        assert!(monitor.check().became_unavailable);

        remote.set_account_status(AccountStatus::Available);
        assert!(!monitor.check().became_unavailable);

        remote.set_account_status(AccountStatus::NoAccount);
        assert!(monitor.check().became_unavailable);
    }

    #[test]
    fn dropped_delegate_is_skipped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let monitor = AccountMonitor::new(remote.clone());

        {
            let delegate: Arc<dyn AccountDelegate> = Arc::new(CountingDelegate {
                calls: AtomicU32::new(0),
            });
            monitor.set_delegate(&delegate);
        }

        remote.set_account_status(AccountStatus::NoAccount);
        // Does not panic or dispatch to the dead delegate.
        assert!(monitor.check().became_unavailable);
    }
}
