//! Same-context change notification.
//!
//! Consumers subscribe to a key and are called synchronously, in
//! subscription order, every time an entry for that key is written.
//! Publishes are ordered by `captured_at`: an entry older than the last one
//! published for its key is never delivered. Nothing here is persisted or
//! seen by other contexts.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::entry::CacheEntry;
use crate::key::CacheKey;

type Callback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<CacheKey, Vec<Subscriber>>>,
    /// `captured_at` of the newest entry published per key
    published: Mutex<HashMap<CacheKey, DateTime<Utc>>>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Vec<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn published(&self) -> MutexGuard<'_, HashMap<CacheKey, DateTime<Utc>>> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `at` as the newest publish for `key` unless something at least
    /// as new was already published.
    fn claim(&self, key: &CacheKey, at: DateTime<Utc>) -> bool {
        let mut published = self.published();
        match published.get(key) {
            Some(last) if *last >= at => false,
            _ => {
                published.insert(key.clone(), at);
                true
            }
        }
    }

    fn is_latest(&self, key: &CacheKey, at: DateTime<Utc>) -> bool {
        self.published().get(key).map_or(true, |last| *last == at)
    }

    fn remove(&self, key: &CacheKey, id: u64) {
        let mut subscribers = self.lock();
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

/// Synchronous publish/subscribe hub for one context.
/// Clone is cheap - clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct IntraContextBus {
    inner: Arc<BusInner>,
}

impl IntraContextBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for changes to `key`. The callback stays
    /// registered until the returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        trace!(key = %key, id, "Subscribed");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        }
    }

    /// Deliver `entry` to every subscriber of `key` before returning.
    /// Returns the number of callbacks that completed without panicking.
    ///
    /// An entry not strictly newer than the last one published for `key` is
    /// dropped, and delivery stops early once a newer entry is published.
    pub fn publish(&self, key: &CacheKey, entry: &CacheEntry) -> usize {
        let at = entry.captured_at();
        if !self.inner.claim(key, at) {
            debug!(key = %key, captured_at = %at, "Dropping publish older than the last one");
            return 0;
        }

        // Snapshot so callbacks can (un)subscribe without deadlocking
        let callbacks: Vec<(u64, Callback)> = match self.inner.lock().get(key) {
            Some(list) => list.iter().map(|s| (s.id, Arc::clone(&s.callback))).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            if !self.inner.is_latest(key, at) {
                trace!(key = %key, "Newer entry published mid-delivery");
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| callback(entry))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(key = %key, subscriber = id, "Subscriber panicked during publish"),
            }
        }
        trace!(key = %key, delivered, "Published");
        delivered
    }

    /// Forget publish history for `key`, so the next entry for it is
    /// delivered whatever its timestamp. Called when the entry is cleared.
    pub fn forget(&self, key: &CacheKey) {
        self.inner.published().remove(key);
    }

    /// [`forget`](Self::forget) every key in `scope`, or every key.
    pub fn forget_matching(&self, scope: Option<&str>) {
        self.inner
            .published()
            .retain(|key, _| scope.is_some_and(|s| !key.in_scope(s)));
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.lock().get(key).map_or(0, Vec::len)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Live registration on an [`IntraContextBus`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    key: CacheKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.key, self.id);
        }
    }
}
