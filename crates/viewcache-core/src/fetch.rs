//! Authoritative refreshes with single-flight deduplication.
//!
//! At most one loader call per key is in flight. Every caller asking for the
//! same key while it runs shares its result. The fetch itself runs on a
//! spawned task, so it completes (and writes back) even if every waiter has
//! gone away.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::resource::ResourceConfig;
use crate::write::{Announce, WriteThrough};

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

struct CoordinatorInner {
    writer: Arc<WriteThrough>,
    in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
    loader_calls: AtomicU64,
}

impl CoordinatorInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedFetch>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clone is cheap - clones share the in-flight table.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    pub(crate) fn new(writer: Arc<WriteThrough>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                writer,
                in_flight: Mutex::new(HashMap::new()),
                loader_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch `key` now, or join the fetch already running for it, and wait
    /// for the result. Errors reach only the callers waiting here.
    pub async fn ensure_fresh(&self, key: &CacheKey, resource: &Arc<ResourceConfig>) -> Result<CacheEntry> {
        let (fetch, _) = self.join_or_start(key, resource, Announce::IfChanged);
        fetch.await
    }

    /// Start a fetch without waiting for it. Returns `false` when one was
    /// already in flight (the request is then a no-op).
    pub fn refresh_in_background(&self, key: &CacheKey, resource: &Arc<ResourceConfig>) -> bool {
        self.join_or_start(key, resource, Announce::IfChanged).1
    }

    /// Background refresh prompted by another context; the write is not
    /// announced back.
    pub(crate) fn revalidate(&self, key: &CacheKey, resource: &Arc<ResourceConfig>) -> bool {
        self.join_or_start(key, resource, Announce::Never).1
    }

    /// Make sure a fetch issued *after* this call lands.
    ///
    /// If a fetch is already running it may have been issued before the
    /// caller's write, so one trailing fetch is chained after it.
    pub fn reconcile(&self, key: &CacheKey, resource: &Arc<ResourceConfig>) {
        let running = self.inner.in_flight().get(key).cloned();
        match running {
            Some(running) => {
                let coordinator = self.clone();
                let key = key.clone();
                let resource = Arc::clone(resource);
                tokio::spawn(async move {
                    let _ = running.await;
                    coordinator.refresh_in_background(&key, &resource);
                });
            }
            None => {
                self.refresh_in_background(key, resource);
            }
        }
    }

    /// Wait for the fetch running for `key`, if any, without starting one.
    pub async fn wait_in_flight(&self, key: &CacheKey) -> Option<Result<CacheEntry>> {
        let running = self.inner.in_flight().get(key).cloned()?;
        Some(running.await)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.in_flight().contains_key(key)
    }

    /// Total loader invocations so far.
    pub fn loader_calls(&self) -> u64 {
        self.inner.loader_calls.load(Ordering::SeqCst)
    }

    fn join_or_start(
        &self,
        key: &CacheKey,
        resource: &Arc<ResourceConfig>,
        announce: Announce,
    ) -> (SharedFetch, bool) {
        let mut in_flight = self.inner.in_flight();
        if let Some(running) = in_flight.get(key) {
            debug!(key = %key, "Joining in-flight fetch");
            return (running.clone(), false);
        }

        let fetch = Self::run(
            Arc::clone(&self.inner),
            key.clone(),
            Arc::clone(resource),
            announce,
        )
        .boxed()
        .shared();
        in_flight.insert(key.clone(), fetch.clone());
        drop(in_flight);

        let driver = fetch.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                // Whoever was waiting has the error; a background refresh just keeps the old entry
                warn!(key = %task_key, error = %e, "Refresh failed, keeping previous entry");
            }
        });
        (fetch, true)
    }

    async fn run(
        inner: Arc<CoordinatorInner>,
        key: CacheKey,
        resource: Arc<ResourceConfig>,
        announce: Announce,
    ) -> Result<CacheEntry> {
        let epoch = inner.writer.epoch(&key);
        inner.loader_calls.fetch_add(1, Ordering::SeqCst);
        debug!(key = %key, "Fetching");

        let loaded = AssertUnwindSafe(resource.load(&key)).catch_unwind().await;
        let outcome = match loaded {
            Ok(Ok(raw)) => resource
                .schema
                .normalize(&resource.name, raw)
                .and_then(|payload| {
                    inner
                        .writer
                        .commit_fetched(&key, &resource, announce, payload, epoch)
                        .map(|written| written.entry)
                        .ok_or_else(|| CacheError::Cleared(key.to_string()))
                }),
            Ok(Err(e)) => Err(CacheError::load(&key, &e)),
            Err(_) => Err(CacheError::Load {
                key: key.to_string(),
                message: "loader panicked".to_string(),
            }),
        };

        // Clear the marker before resolving so a caller arriving after this
        // point starts a new fetch instead of getting this result.
        inner.in_flight().remove(&key);
        outcome
    }
}
