//! Optimistic local mutations reconciled against the server afterwards.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::fetch::FetchCoordinator;
use crate::key::CacheKey;
use crate::resource::ResourceConfig;
use crate::write::{Announce, WriteThrough};

/// Shallow-merge `partial` onto `current`.
///
/// Top-level keys of `partial` replace those of `current`; nested objects
/// are replaced, not merged. If either side is not an object, `partial`
/// replaces the payload wholesale.
pub fn shallow_merge(current: Option<&Value>, partial: Value) -> Value {
    match (current, partial) {
        (Some(Value::Object(current)), Value::Object(partial)) => {
            let mut merged = current.clone();
            merged.extend(partial);
            Value::Object(merged)
        }
        (None, Value::Object(partial)) => Value::Object(partial),
        (_, partial) => partial,
    }
}

/// Applies local edits immediately, then asks the coordinator for ground truth.
#[derive(Clone)]
pub struct OptimisticUpdateManager {
    writer: Arc<WriteThrough>,
    coordinator: FetchCoordinator,
}

impl OptimisticUpdateManager {
    pub(crate) fn new(writer: Arc<WriteThrough>, coordinator: FetchCoordinator) -> Self {
        Self { writer, coordinator }
    }

    /// Merge `partial` into the current entry, write it through and publish
    /// it right away, then start a reconciling fetch. Must be called inside
    /// a tokio runtime.
    pub fn apply(&self, key: &CacheKey, resource: &Arc<ResourceConfig>, partial: Value) -> CacheEntry {
        let entry = self.write_local(key, resource, partial);
        self.coordinator.reconcile(key, resource);
        entry
    }

    /// Like [`apply`](Self::apply), but also performs the remote mutation.
    ///
    /// The optimistic entry is visible while `mutation` runs. Afterwards a
    /// reconciling fetch runs whether the mutation succeeded or not, so a
    /// rejected edit is rolled back by ground truth.
    pub async fn apply_with<Fut>(
        &self,
        key: &CacheKey,
        resource: &Arc<ResourceConfig>,
        partial: Value,
        mutation: Fut,
    ) -> Result<CacheEntry>
    where
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let entry = self.write_local(key, resource, partial);
        let outcome = mutation.await;
        self.coordinator.reconcile(key, resource);
        match outcome {
            Ok(()) => Ok(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "Remote mutation failed, reconciling");
                Err(CacheError::Mutation {
                    key: key.to_string(),
                    message: format!("{:#}", e),
                })
            }
        }
    }

    fn write_local(&self, key: &CacheKey, resource: &ResourceConfig, partial: Value) -> CacheEntry {
        // Make sure a persisted entry is the merge base after a restart
        self.writer.hydrate(key);
        let written = self.writer.commit(key, resource, Announce::IfChanged, |current| {
            shallow_merge(current.map(CacheEntry::payload), partial)
        });
        debug!(key = %key, "Applied optimistic update");
        written.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CrossContextChannel;
    use crate::clock::{Clock, ManualClock};
    use crate::resource::loader_fn;
    use crate::storage::SharedStorage;
    use crate::store::PersistentStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn manager() -> (OptimisticUpdateManager, Arc<WriteThrough>) {
        let handle = SharedStorage::in_memory().connect();
        let writer = Arc::new(WriteThrough::new(
            PersistentStore::new(handle.clone()),
            CrossContextChannel::new(handle),
            Arc::new(ManualClock::at_epoch()),
        ));
        let coordinator = FetchCoordinator::new(Arc::clone(&writer));
        (OptimisticUpdateManager::new(Arc::clone(&writer), coordinator), writer)
    }

    fn key() -> CacheKey {
        CacheKey::new("counter", "user-1")
    }

    #[test]
    fn test_shallow_merge() {
        let current = json!({"count": 1, "nested": {"a": 1}, "keep": true});
        let merged = shallow_merge(Some(&current), json!({"count": 2, "nested": {"b": 2}}));
        assert_eq!(merged, json!({"count": 2, "nested": {"b": 2}, "keep": true}));

        assert_eq!(shallow_merge(None, json!({"count": 5})), json!({"count": 5}));
        assert_eq!(shallow_merge(Some(&json!([1, 2])), json!({"a": 1})), json!({"a": 1}));
        assert_eq!(shallow_merge(Some(&json!({"a": 1})), json!([3])), json!([3]));
    }

    #[tokio::test]
    async fn test_apply_publishes_then_reconciles() {
        let (manager, writer) = manager();
        let resource = Arc::new(ResourceConfig::new(
            "counter",
            loader_fn(|_| async { Ok(json!({"count": 5, "total": 12})) }),
        ));
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let _sub = writer
            .bus
            .subscribe(&key(), move |e| sink.lock().unwrap().push(e.clone()));

        let optimistic = manager.apply(&key(), &resource, json!({"count": 5}));
        assert_eq!(optimistic.payload(), &json!({"count": 5}));
        assert_eq!(published.lock().unwrap().len(), 1);

        for _ in 0..100 {
            if published.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let published = published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].payload(), &json!({"count": 5, "total": 12}));
        assert!(published[1].captured_at() > published[0].captured_at());
        assert_eq!(writer.memory.get(&key()).as_ref(), Some(&published[1]));
    }

    #[tokio::test]
    async fn test_failed_mutation_is_rolled_back() {
        let (manager, writer) = manager();
        let resource = Arc::new(ResourceConfig::new(
            "counter",
            loader_fn(|_| async { Ok(json!({"count": 1})) }),
        ));

        let err = manager
            .apply_with(&key(), &resource, json!({"count": 99}), async {
                Err(anyhow::anyhow!("403 Forbidden"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Mutation { .. }));

        for _ in 0..100 {
            if writer.memory.get(&key()).map(|e| e.payload().clone()) == Some(json!({"count": 1})) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("optimistic value was never replaced by ground truth");
    }

    #[tokio::test]
    async fn test_apply_merges_onto_persisted_entry() {
        let (manager, writer) = manager();
        let resource = Arc::new(ResourceConfig::new(
            "counter",
            loader_fn(|_| async { Ok(json!({"count": 1, "total": 1})) }),
        ));
        writer
            .persistent
            .write(&key(), &CacheEntry::new(json!({"count": 1, "total": 12}), ManualClock::at_epoch().now()))
            .unwrap();

        let entry = manager.apply(&key(), &resource, json!({"count": 2}));
        assert_eq!(entry.payload(), &json!({"count": 2, "total": 12}));
    }
}
