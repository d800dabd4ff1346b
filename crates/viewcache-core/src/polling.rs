//! Fixed-cadence refreshes for resources changed by other actors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::fetch::FetchCoordinator;
use crate::key::CacheKey;
use crate::resource::ResourceConfig;

#[derive(Default)]
struct Timers {
    tasks: Mutex<HashMap<CacheKey, JoinHandle<()>>>,
}

impl Timers {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, task) in self.lock().drain() {
            task.abort();
        }
    }
}

/// One timer task per polled key. Clone is cheap - clones share the timers.
#[derive(Clone)]
pub struct PollingDriver {
    coordinator: FetchCoordinator,
    timers: Arc<Timers>,
}

impl PollingDriver {
    pub fn new(coordinator: FetchCoordinator) -> Self {
        Self {
            coordinator,
            timers: Arc::new(Timers::default()),
        }
    }

    /// Refresh `key` now and then every `interval` until stopped.
    ///
    /// Starting an already polled key replaces its timer. Ticks ignore
    /// staleness; a failed tick keeps the previous entry and the next tick
    /// tries again. Must be called inside a tokio runtime.
    pub fn start(&self, key: &CacheKey, resource: &Arc<ResourceConfig>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(CacheError::InvalidConfig(format!(
                "poll interval for {} must be non-zero",
                key
            )));
        }

        let coordinator = self.coordinator.clone();
        let task_key = key.clone();
        let resource = Arc::clone(resource);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // First tick completes immediately
                ticker.tick().await;
                match coordinator.ensure_fresh(&task_key, &resource).await {
                    Ok(entry) => debug!(key = %task_key, hash = %entry.hash(), "Poll refresh complete"),
                    Err(e) => warn!(key = %task_key, error = %e, "Poll refresh failed"),
                }
            }
        });

        if let Some(previous) = self.timers.lock().insert(key.clone(), task) {
            previous.abort();
            debug!(key = %key, "Restarted polling");
        } else {
            info!(key = %key, interval_ms = interval.as_millis() as u64, "Started polling");
        }
        Ok(())
    }

    /// Stop polling `key`. Returns `false` if it was not being polled.
    pub fn stop(&self, key: &CacheKey) -> bool {
        match self.timers.lock().remove(key) {
            Some(task) => {
                task.abort();
                info!(key = %key, "Stopped polling");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (key, task) in self.timers.lock().drain() {
            task.abort();
            debug!(key = %key, "Stopped polling");
        }
    }

    pub fn is_polling(&self, key: &CacheKey) -> bool {
        self.timers
            .lock()
            .get(key)
            .is_some_and(|task| !task.is_finished())
    }

    pub fn polled_keys(&self) -> Vec<CacheKey> {
        self.timers.lock().keys().cloned().collect()
    }
}
