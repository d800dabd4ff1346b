//! Cross-context invalidation over shared storage change events.
//!
//! A context that wrote a resource leaves a small [`InvalidationSignal`]
//! under a well-known storage key. Every other context connected to the same
//! storage receives the change event and re-validates on its own; the signal
//! carries no payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::storage::{ContextId, StorageEvent, StorageHandle};

/// Storage key the signals are written under.
pub const CHANNEL_KEY: &str = "viewcache:invalidate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationSignal {
    pub scope_key: String,
    pub timestamp: DateTime<Utc>,
    pub origin_resource: String,
    pub origin_context: ContextId,
}

#[derive(Clone)]
pub struct CrossContextChannel {
    handle: StorageHandle,
}

impl CrossContextChannel {
    pub fn new(handle: StorageHandle) -> Self {
        Self { handle }
    }

    /// Tell other contexts that `origin_resource` in `scope_key` changed.
    pub fn announce(
        &self,
        scope_key: &str,
        origin_resource: &str,
        now: DateTime<Utc>,
    ) -> Result<InvalidationSignal> {
        let signal = InvalidationSignal {
            scope_key: scope_key.to_string(),
            timestamp: now,
            origin_resource: origin_resource.to_string(),
            origin_context: self.handle.context(),
        };
        let contents = serde_json::to_string(&signal).map_err(|e| CacheError::Serialization {
            key: CHANNEL_KEY.to_string(),
            message: e.to_string(),
        })?;
        self.handle.set(CHANNEL_KEY, &contents)?;
        debug!(scope = scope_key, resource = origin_resource, "Announced change to other contexts");
        Ok(signal)
    }

    /// Extract a signal from a storage event, if it is one.
    pub fn decode(event: &StorageEvent) -> Option<InvalidationSignal> {
        if event.key != CHANNEL_KEY {
            return None;
        }
        let contents = event.new_value.as_deref()?;
        match serde_json::from_str(contents) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed invalidation signal");
                None
            }
        }
    }

    /// Run `handler` for every signal written by another context until the
    /// returned listener is dropped. Must be called inside a tokio runtime.
    pub fn listen<F>(&self, handler: F) -> ChannelListener
    where
        F: Fn(InvalidationSignal) + Send + Sync + 'static,
    {
        // Subscribe before spawning so no signal written after this call is missed
        let mut events = self.handle.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(signal) = Self::decode(&event) {
                    handler(signal);
                }
            }
            debug!("Shared storage closed, invalidation listener stopping");
        });
        ChannelListener { task }
    }
}

/// Background task delivering signals. Aborted on drop.
pub struct ChannelListener {
    task: JoinHandle<()>,
}

impl ChannelListener {
    pub fn stop(self) {}
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
