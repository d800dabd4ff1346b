//! The single write path shared by fetches and optimistic updates:
//! memory, then persistent mirror, then the bus, then other contexts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::IntraContextBus;
use crate::channel::CrossContextChannel;
use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::resource::ResourceConfig;
use crate::store::{MemoryStore, PersistentStore, Written};

/// Clear counters a fetch result is checked against. A result is kept only
/// if nothing covering its key was cleared while it loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Epoch {
    all: u64,
    scope: u64,
    key: u64,
}

#[derive(Debug, Default)]
struct Epochs {
    all: u64,
    scopes: HashMap<String, u64>,
    keys: HashMap<CacheKey, u64>,
}

impl Epochs {
    fn of(&self, key: &CacheKey) -> Epoch {
        Epoch {
            all: self.all,
            scope: self.scopes.get(&key.scope).copied().unwrap_or(0),
            key: self.keys.get(key).copied().unwrap_or(0),
        }
    }
}

/// Whether a write should be announced to other contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Announce {
    /// Announce when the resource broadcasts and the payload changed.
    IfChanged,
    /// Write caused by another context's signal; announcing would echo back.
    Never,
}

pub(crate) struct WriteThrough {
    pub(crate) memory: MemoryStore,
    pub(crate) persistent: PersistentStore,
    pub(crate) bus: IntraContextBus,
    pub(crate) channel: CrossContextChannel,
    pub(crate) clock: Arc<dyn Clock>,
    /// Serializes memory + persistent writes so the mirror ends in the same order.
    commit_lock: Mutex<()>,
    /// Bumped by clears; fetches started before a clear of their key are discarded.
    epochs: Mutex<Epochs>,
}

impl WriteThrough {
    pub(crate) fn new(
        persistent: PersistentStore,
        channel: CrossContextChannel,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: MemoryStore::new(),
            persistent,
            bus: IntraContextBus::new(),
            channel,
            clock,
            commit_lock: Mutex::new(()),
            epochs: Mutex::new(Epochs::default()),
        }
    }

    fn epochs(&self) -> MutexGuard<'_, Epochs> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn epoch(&self, key: &CacheKey) -> Epoch {
        self.epochs().of(key)
    }

    /// Current entry for `key`, pulling it up from the persistent tier on a
    /// memory miss. The flag is true when another context invalidated it.
    pub(crate) fn hydrate(&self, key: &CacheKey) -> Option<(CacheEntry, bool)> {
        if let Some(found) = self.memory.lookup(key) {
            return Some(found);
        }
        let entry = self.persistent.load(key)?;
        debug!(key = %key, "Hydrated entry from persistent storage");
        self.memory.put(key, entry);
        self.memory.lookup(key)
    }

    /// Read-modify-write `key` and propagate the result.
    pub(crate) fn commit<F>(
        &self,
        key: &CacheKey,
        resource: &ResourceConfig,
        announce: Announce,
        derive: F,
    ) -> Written
    where
        F: FnOnce(Option<&CacheEntry>) -> Value,
    {
        let written = {
            let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store(key, derive)
        };
        self.propagate(key, resource, announce, &written);
        written
    }

    /// Commit a fetched payload unless `key` was cleared since `epoch`.
    pub(crate) fn commit_fetched(
        &self,
        key: &CacheKey,
        resource: &ResourceConfig,
        announce: Announce,
        payload: Value,
        epoch: Epoch,
    ) -> Option<Written> {
        let written = {
            let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.epoch(key) != epoch {
                debug!(key = %key, "Discarding fetch result, cache was cleared while loading");
                return None;
            }
            self.store(key, |_| payload)
        };
        self.propagate(key, resource, announce, &written);
        Some(written)
    }

    fn store<F>(&self, key: &CacheKey, derive: F) -> Written
    where
        F: FnOnce(Option<&CacheEntry>) -> Value,
    {
        let written = self.memory.update(key, self.clock.now(), derive);
        if let Err(e) = self.persistent.write(key, &written.entry) {
            // The memory tier stays authoritative for this context
            warn!(key = %key, error = %e, "Failed to persist cache entry");
        }
        written
    }

    fn propagate(&self, key: &CacheKey, resource: &ResourceConfig, announce: Announce, written: &Written) {
        let unchanged = written.unchanged();
        if unchanged && !resource.publish_unchanged {
            debug!(key = %key, "Payload unchanged, skipping publish");
            return;
        }

        // A newer write landed while we were persisting: let it speak instead
        let superseded = self
            .memory
            .get(key)
            .is_some_and(|current| current.captured_at() > written.entry.captured_at());
        if superseded {
            debug!(key = %key, "Write superseded before publish");
            return;
        }

        self.bus.publish(key, &written.entry);

        if announce == Announce::IfChanged && resource.broadcast && !unchanged {
            if let Err(e) =
                self.channel
                    .announce(&key.scope, &key.resource, written.entry.captured_at())
            {
                warn!(key = %key, error = %e, "Failed to announce change to other contexts");
            }
        }
    }

    pub(crate) fn remove(&self, key: &CacheKey) {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        *self.epochs().keys.entry(key.clone()).or_default() += 1;
        self.memory.remove(key);
        self.bus.forget(key);
        if let Err(e) = self.persistent.remove(key) {
            warn!(key = %key, error = %e, "Failed to remove persisted entry");
        }
    }

    /// Drop every entry whose scope matches, or every entry when `scope` is `None`.
    pub(crate) fn remove_matching(&self, scope: Option<&str>) -> Vec<CacheKey> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut epochs = self.epochs();
            match scope {
                Some(scope) => *epochs.scopes.entry(scope.to_string()).or_default() += 1,
                None => epochs.all += 1,
            }
        }

        let mut removed = match scope {
            Some(scope) => self.memory.remove_scope(scope),
            None => self.memory.clear(),
        };
        self.bus.forget_matching(scope);
        match self.persistent.keys() {
            Ok(keys) => {
                for key in keys {
                    if scope.is_some_and(|s| !key.in_scope(s)) {
                        continue;
                    }
                    if let Err(e) = self.persistent.remove(&key) {
                        warn!(key = %key, error = %e, "Failed to remove persisted entry");
                    }
                    if !removed.contains(&key) {
                        removed.push(key);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list persisted entries"),
        }
        removed
    }
}
