use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::core::path::path_is_under;

/// Change callback: `(value, full_path)`, with `None` for deletions.
pub type SubscriberFn = Arc<dyn Fn(Option<&Value>, &str) + Send + Sync>;

struct Subscription {
    id: u64,
    prefix: String,
    callback: SubscriberFn,
}

/// Path-prefix subscriptions against the local store.
///
/// The table is copy-on-write: dispatch iterates an immutable snapshot, so a
/// callback that unsubscribes (itself or another subscription) cannot
/// corrupt the iteration. Callbacks fire after the commit is durable, in
/// per-path commit order.
pub struct SubscriptionManager {
    next_id: AtomicU64,
    subscriptions: RwLock<Arc<Vec<Arc<Subscription>>>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subscriptions", &self.subscriptions.read().unwrap().len())
            .finish()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        prefix: &str,
        callback: SubscriberFn,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            prefix: prefix.to_string(),
            callback,
        });
        {
            let mut table = self.subscriptions.write().unwrap();
            let mut next = table.as_ref().clone();
            next.push(subscription);
            *table = Arc::new(next);
        }
        debug!("subscribed #{} to '{}'", id, prefix);
        SubscriptionHandle {
            id,
            manager: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut table = self.subscriptions.write().unwrap();
        if table.iter().any(|subscription| subscription.id == id) {
            let next: Vec<_> = table
                .iter()
                .filter(|subscription| subscription.id != id)
                .cloned()
                .collect();
            *table = Arc::new(next);
            debug!("unsubscribed #{}", id);
        }
    }

    /// Deliver one accepted change to every matching subscriber.
    pub fn notify(&self, path: &str, value: Option<&Value>) {
        let snapshot = self.subscriptions.read().unwrap().clone();
        for subscription in snapshot.iter() {
            if path_is_under(path, &subscription.prefix) {
                (subscription.callback)(value, path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe handle; calling `unsubscribe` more than once is a no-op.
pub struct SubscriptionHandle {
    id: u64,
    manager: std::sync::Weak<SubscriptionManager>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}
