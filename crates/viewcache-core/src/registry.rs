//! The engine facade consumed by views.
//!
//! A `CacheRegistry` is one context: it owns the memory tier, connects to a
//! [`SharedStorage`] for persistence and cross-context signals, and runs
//! every registered resource through the same fresh/stale/expired machine.
//! Registries are independent of each other; build one per session and
//! call [`shutdown`](CacheRegistry::shutdown) (or drop it) at sign-out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::bus::Subscription;
use crate::channel::{ChannelListener, CrossContextChannel, InvalidationSignal};
use crate::clock::{Clock, SystemClock};
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::fetch::FetchCoordinator;
use crate::key::CacheKey;
use crate::optimistic::OptimisticUpdateManager;
use crate::polling::PollingDriver;
use crate::resource::ResourceConfig;
use crate::staleness::{Staleness, StalenessPolicy};
use crate::storage::{ContextId, SharedStorage};
use crate::store::PersistentStore;
use crate::write::WriteThrough;

/// What a non-blocking read found.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Best-known entry, even if expired. `None` when nothing is cached.
    pub entry: Option<CacheEntry>,
    pub staleness: Staleness,
    /// A refresh is running (or was just started) for this key.
    pub refreshing: bool,
}

impl Snapshot {
    /// Payload a view may render right now.
    pub fn displayable(&self) -> Option<&CacheEntry> {
        self.entry.as_ref().filter(|_| self.staleness.is_displayable())
    }

    /// The view should show a loading state.
    pub fn is_loading(&self) -> bool {
        self.displayable().is_none()
    }
}

struct Registered {
    config: Arc<ResourceConfig>,
    policy: StalenessPolicy,
}

struct RegistryInner {
    resources: RwLock<HashMap<String, Registered>>,
    writer: Arc<WriteThrough>,
    coordinator: FetchCoordinator,
    optimistic: OptimisticUpdateManager,
    polling: PollingDriver,
    context: ContextId,
    listener: Mutex<Option<ChannelListener>>,
}

impl RegistryInner {
    fn resource(&self, name: &str) -> Result<(Arc<ResourceConfig>, StalenessPolicy)> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        resources
            .get(name)
            .map(|r| (Arc::clone(&r.config), r.policy))
            .ok_or_else(|| CacheError::UnknownResource(name.to_string()))
    }

    fn on_signal(&self, signal: InvalidationSignal) {
        let key = CacheKey::new(signal.origin_resource, signal.scope_key);
        let Ok((resource, _)) = self.resource(&key.resource) else {
            debug!(key = %key, "Ignoring signal for unregistered resource");
            return;
        };
        let held = self.writer.memory.invalidate(&key);
        let watched = self.writer.bus.subscriber_count(&key) > 0;
        debug!(key = %key, origin = signal.origin_context, held, watched, "Invalidated by another context");
        if held || watched {
            self.coordinator.revalidate(&key, &resource);
        }
    }
}

/// Clone is cheap - clones drive the same engine.
#[derive(Clone)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

impl CacheRegistry {
    /// Connect a new context to `storage` using the system clock.
    /// Must be called inside a tokio runtime.
    pub fn new(storage: &SharedStorage) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: &SharedStorage, clock: Arc<dyn Clock>) -> Self {
        let handle = storage.connect();
        let context = handle.context();
        let channel = CrossContextChannel::new(handle.clone());
        let writer = Arc::new(WriteThrough::new(
            PersistentStore::new(handle),
            channel.clone(),
            clock,
        ));
        let coordinator = FetchCoordinator::new(Arc::clone(&writer));
        let inner = Arc::new(RegistryInner {
            resources: RwLock::new(HashMap::new()),
            optimistic: OptimisticUpdateManager::new(Arc::clone(&writer), coordinator.clone()),
            polling: PollingDriver::new(coordinator.clone()),
            writer,
            coordinator,
            context,
            listener: Mutex::new(None),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        let listener = channel.listen(move |signal| {
            if let Some(inner) = weak.upgrade() {
                inner.on_signal(signal);
            }
        });
        *inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);

        info!(context, "Cache registry started");
        Self { inner }
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    /// Register (or replace) a resource.
    pub fn register(&self, config: ResourceConfig) -> Result<()> {
        config.validate()?;
        let policy = config.policy()?;
        debug!(resource = %config.name, ?config, "Registered resource");
        let mut resources = self.inner.resources.write().unwrap_or_else(PoisonError::into_inner);
        resources.insert(
            config.name.clone(),
            Registered {
                config: Arc::new(config),
                policy,
            },
        );
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Result<Arc<ResourceConfig>> {
        self.inner.resource(name).map(|(config, _)| config)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.resource(name).is_ok()
    }

    fn classify(&self, policy: &StalenessPolicy, found: Option<&(CacheEntry, bool)>) -> Staleness {
        let now = self.inner.writer.clock.now();
        match found {
            Some((entry, true)) => policy.classify_invalidated(Some(entry), now),
            Some((entry, false)) => policy.classify(Some(entry), now),
            None => Staleness::Expired,
        }
    }

    /// Best-known entry without waiting. Stale and expired keys get a
    /// background refresh (one per key, however many views ask).
    pub fn snapshot(&self, key: &CacheKey) -> Result<Snapshot> {
        let (resource, policy) = self.inner.resource(&key.resource)?;
        let found = self.inner.writer.hydrate(key);
        let staleness = self.classify(&policy, found.as_ref());
        if staleness.needs_refresh() {
            self.inner.coordinator.refresh_in_background(key, &resource);
        }
        Ok(Snapshot {
            entry: found.map(|(entry, _)| entry),
            staleness,
            refreshing: self.inner.coordinator.is_in_flight(key),
        })
    }

    /// Entry following the staleness policy: fresh entries are returned
    /// as-is, stale ones are returned while a background refresh starts,
    /// and expired (or missing) ones are refreshed before returning.
    pub async fn load(&self, key: &CacheKey) -> Result<CacheEntry> {
        let (resource, policy) = self.inner.resource(&key.resource)?;
        let found = self.inner.writer.hydrate(key);
        match (self.classify(&policy, found.as_ref()), found) {
            (Staleness::Fresh, Some((entry, _))) => {
                debug!(key = %key, "Cache hit (fresh)");
                Ok(entry)
            }
            (Staleness::Stale, Some((entry, _))) => {
                debug!(key = %key, "Cache hit (stale), refreshing in background");
                self.inner.coordinator.refresh_in_background(key, &resource);
                Ok(entry)
            }
            _ => {
                debug!(key = %key, "Cache miss or expired, waiting for refresh");
                self.inner.coordinator.ensure_fresh(key, &resource).await
            }
        }
    }

    /// [`load`](Self::load) and decode into `T`.
    pub async fn load_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<T> {
        let entry = self.load(key).await?;
        entry.decode().map_err(|e| CacheError::Shape {
            resource: key.resource.clone(),
            message: e.to_string(),
        })
    }

    /// Fetch now regardless of age and wait for the result.
    pub async fn refresh(&self, key: &CacheKey) -> Result<CacheEntry> {
        let (resource, _) = self.inner.resource(&key.resource)?;
        self.inner.coordinator.ensure_fresh(key, &resource).await
    }

    /// Wait for the refresh already running for `key`, if there is one.
    /// Never starts a fetch of its own.
    pub async fn wait_for_refresh(&self, key: &CacheKey) -> Option<Result<CacheEntry>> {
        self.inner.coordinator.wait_in_flight(key).await
    }

    /// Drop the entry from both tiers and stop polling it. Fetches already
    /// running for it are discarded when they finish.
    pub fn clear(&self, key: &CacheKey) {
        self.inner.polling.stop(key);
        self.inner.writer.remove(key);
        debug!(key = %key, "Cleared");
    }

    /// Drop every entry of one scope and stop polling them (sign-out).
    pub fn clear_scope(&self, scope: &str) -> Vec<CacheKey> {
        for key in self.inner.polling.polled_keys() {
            if key.in_scope(scope) {
                self.inner.polling.stop(&key);
            }
        }
        let removed = self.inner.writer.remove_matching(Some(scope));
        info!(scope, count = removed.len(), "Cleared scope");
        removed
    }

    pub fn clear_all(&self) -> Vec<CacheKey> {
        self.inner.polling.stop_all();
        let removed = self.inner.writer.remove_matching(None);
        info!(count = removed.len(), "Cleared all cached entries");
        removed
    }

    /// Call `callback` with every new entry for `key` until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        self.inner.writer.bus.subscribe(key, callback)
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner.writer.bus.subscriber_count(key)
    }

    /// Apply a local edit immediately and reconcile with the server after.
    pub fn apply(&self, key: &CacheKey, partial: Value) -> Result<CacheEntry> {
        let (resource, _) = self.inner.resource(&key.resource)?;
        Ok(self.inner.optimistic.apply(key, &resource, partial))
    }

    /// [`apply`](Self::apply) with a typed partial payload.
    pub fn apply_typed<P: Serialize>(&self, key: &CacheKey, partial: &P) -> Result<CacheEntry> {
        let partial = serde_json::to_value(partial).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.apply(key, partial)
    }

    /// Apply a local edit, run the remote `mutation`, then reconcile.
    pub async fn apply_with<Fut>(&self, key: &CacheKey, partial: Value, mutation: Fut) -> Result<CacheEntry>
    where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (resource, _) = self.inner.resource(&key.resource)?;
        self.inner
            .optimistic
            .apply_with(key, &resource, partial, mutation)
            .await
    }

    /// Poll `key` at its resource's configured interval.
    pub fn start_polling(&self, key: &CacheKey) -> Result<()> {
        let (resource, _) = self.inner.resource(&key.resource)?;
        let interval = resource.poll_interval.ok_or_else(|| {
            CacheError::InvalidConfig(format!("{} has no poll interval", resource.name))
        })?;
        self.inner.polling.start(key, &resource, interval)
    }

    pub fn start_polling_every(&self, key: &CacheKey, interval: Duration) -> Result<()> {
        let (resource, _) = self.inner.resource(&key.resource)?;
        self.inner.polling.start(key, &resource, interval)
    }

    pub fn stop_polling(&self, key: &CacheKey) -> bool {
        self.inner.polling.stop(key)
    }

    pub fn is_polling(&self, key: &CacheKey) -> bool {
        self.inner.polling.is_polling(key)
    }

    /// Loader invocations so far, across all keys.
    pub fn loader_calls(&self) -> u64 {
        self.inner.coordinator.loader_calls()
    }

    /// Age of the cached entry for display, e.g. "5m ago".
    pub fn age_display(&self, key: &CacheKey) -> Option<String> {
        let (entry, _) = self.inner.writer.hydrate(key)?;
        Some(entry.age_display(self.inner.writer.clock.now()))
    }

    /// Stop polling and stop listening to other contexts. Cached entries
    /// stay in the persistent tier.
    pub fn shutdown(&self) {
        self.inner.polling.stop_all();
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(context = self.inner.context, "Cache registry shut down");
    }
}
