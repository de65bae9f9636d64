//! Notification hub: typed subscriber registry and dispatch.

use parking_lot::Mutex;
use prefsync_core::{Notification, NotificationType};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A subscriber callback.
///
/// The hub stores only a weak handle: dropping the `Arc` on the
/// subscriber side is enough to end delivery, so the hub never extends
/// a subscriber's lifetime.
pub type NotificationCallback = dyn Fn(&Notification) + Send + Sync;

/// Token returned by `subscribe`, usable for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscription {
    token: SubscriptionToken,
    target: String,
    callback: Weak<NotificationCallback>,
}

/// Maintains subscriber lists per notification category and dispatches
/// events, decoupling the sync pass from its consumers.
///
/// Delivery is synchronous, in registration order. A panicking
/// subscriber is isolated and never prevents delivery to the rest.
/// Subscribe and unsubscribe are safe to call from any thread while a
/// pass is publishing.
#[derive(Default)]
pub struct NotificationHub {
    subscriptions: Mutex<HashMap<NotificationType, Vec<Subscription>>>,
    next_token: Mutex<u64>,
}

impl NotificationHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one notification category.
    ///
    /// `target` is a caller-chosen label grouping related
    /// subscriptions, so a host object can drop all of its callbacks
    /// at once with `remove_target`.
    pub fn subscribe(
        &self,
        notification_type: NotificationType,
        target: impl Into<String>,
        callback: &Arc<NotificationCallback>,
    ) -> SubscriptionToken {
        let token = {
            let mut next = self.next_token.lock();
            *next += 1;
            SubscriptionToken(*next)
        };

        self.subscriptions
            .lock()
            .entry(notification_type)
            .or_default()
            .push(Subscription {
                token,
                target: target.into(),
                callback: Arc::downgrade(callback),
            });
        token
    }

    /// Removes one subscription. Returns true if it was present.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        for list in subscriptions.values_mut() {
            let before = list.len();
            list.retain(|s| s.token != token);
            if list.len() != before {
                return true;
            }
        }
        false
    }

    /// Removes every subscription a target registered for a category.
    ///
    /// Returns how many subscriptions were removed.
    pub fn remove_target(&self, notification_type: NotificationType, target: &str) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let Some(list) = subscriptions.get_mut(&notification_type) else {
            return 0;
        };
        let before = list.len();
        list.retain(|s| s.target != target);
        before - list.len()
    }

    /// Removes every subscription of every category.
    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }

    /// Number of live subscriptions for a category.
    pub fn subscriber_count(&self, notification_type: NotificationType) -> usize {
        self.subscriptions
            .lock()
            .get(&notification_type)
            .map(|list| {
                list.iter()
                    .filter(|s| s.callback.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Delivers a payload to every current subscriber of its category.
    ///
    /// Dead subscribers (dropped callbacks) are pruned along the way.
    /// Empty payloads are not delivered.
    pub fn publish(&self, notification: &Notification) {
        if notification.is_empty() {
            return;
        }
        let notification_type = notification.notification_type();

        // Snapshot under the lock, dispatch outside it, so a callback
        // may subscribe or unsubscribe without deadlocking.
        let callbacks: Vec<Arc<NotificationCallback>> = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(list) = subscriptions.get_mut(&notification_type) else {
                return;
            };
            list.retain(|s| s.callback.strong_count() > 0);
            list.iter().filter_map(|s| s.callback.upgrade()).collect()
        };

        debug!(
            ?notification_type,
            subscribers = callbacks.len(),
            "publishing notification"
        );

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
                warn!(?notification_type, "notification subscriber panicked");
            }
        }
    }
}
