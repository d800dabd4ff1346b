use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::entry::CacheEntry;
use crate::key::CacheKey;

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    /// Set when another context announced a change we have not fetched yet.
    invalidated: bool,
}

/// Result of a read-modify-write on the memory tier.
#[derive(Debug, Clone)]
pub struct Written {
    pub entry: CacheEntry,
    pub previous: Option<CacheEntry>,
}

impl Written {
    /// The write did not change the payload.
    pub fn unchanged(&self) -> bool {
        self.previous
            .as_ref()
            .is_some_and(|previous| previous.hash() == self.entry.hash())
    }
}

/// Key-addressed table of live entries for one context.
///
/// Writes to a key are totally ordered: every write is stamped strictly
/// later than the entry it replaces, and entries older than the current one
/// are refused.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.read().get(key).map(|slot| slot.entry.clone())
    }

    /// The entry plus whether it has been invalidated by another context.
    pub fn lookup(&self, key: &CacheKey) -> Option<(CacheEntry, bool)> {
        self.read()
            .get(key)
            .map(|slot| (slot.entry.clone(), slot.invalidated))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read().contains_key(key)
    }

    /// Atomically derive and store a new payload from the current entry.
    ///
    /// The new entry is stamped `max(now, previous + 1ms)`, so it always
    /// supersedes what it replaces even if the clock has not moved.
    pub fn update<F>(&self, key: &CacheKey, now: DateTime<Utc>, derive: F) -> Written
    where
        F: FnOnce(Option<&CacheEntry>) -> Value,
    {
        let mut slots = self.write_lock();
        let previous = slots.get(key).map(|slot| slot.entry.clone());
        let payload = derive(previous.as_ref());
        let captured_at = match &previous {
            Some(prev) if prev.captured_at() >= now => prev.captured_at() + Duration::milliseconds(1),
            _ => now,
        };
        let entry = CacheEntry::new(payload, captured_at);
        slots.insert(
            key.clone(),
            Slot {
                entry: entry.clone(),
                invalidated: false,
            },
        );
        Written { entry, previous }
    }

    /// Replace the payload wholesale.
    pub fn write(&self, key: &CacheKey, payload: Value, now: DateTime<Utc>) -> Written {
        self.update(key, now, |_| payload)
    }

    /// Insert an already-built entry unless the current one is newer.
    /// Returns `false` when the entry was discarded as outdated.
    pub fn put(&self, key: &CacheKey, entry: CacheEntry) -> bool {
        let mut slots = self.write_lock();
        if let Some(current) = slots.get(key) {
            if entry.captured_at() < current.entry.captured_at() {
                return false;
            }
        }
        slots.insert(
            key.clone(),
            Slot {
                entry,
                invalidated: false,
            },
        );
        true
    }

    /// Mark an entry as outdated without dropping its payload.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.write_lock().get_mut(key) {
            Some(slot) => {
                slot.invalidated = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.write_lock().remove(key).map(|slot| slot.entry)
    }

    /// Drop every entry of one scope, returning the removed keys.
    pub fn remove_scope(&self, scope: &str) -> Vec<CacheKey> {
        let mut slots = self.write_lock();
        let keys: Vec<CacheKey> = slots.keys().filter(|k| k.in_scope(scope)).cloned().collect();
        for key in &keys {
            slots.remove(key);
        }
        keys
    }

    pub fn clear(&self) -> Vec<CacheKey> {
        self.write_lock().drain().map(|(key, _)| key).collect()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> CacheKey {
        CacheKey::new("roster", "org-1")
    }

    #[test]
    fn test_write_then_get() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let written = store.write(&key(), json!({"count": 1}), now);
        assert!(written.previous.is_none());
        assert_eq!(written.entry.captured_at(), now);
        assert_eq!(store.get(&key()).unwrap(), written.entry);
    }

    #[test]
    fn test_writes_are_strictly_ordered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.write(&key(), json!(1), now).entry;
        // Same clock reading: the second write still lands later
        let second = store.write(&key(), json!(2), now).entry;
        assert!(second.captured_at() > first.captured_at());
        // Clock went backwards: still later
        let third = store.write(&key(), json!(3), now - Duration::seconds(5)).entry;
        assert!(third.captured_at() > second.captured_at());
    }

    #[test]
    fn test_put_discards_older_entry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.write(&key(), json!("new"), now);

        let older = CacheEntry::new(json!("old"), now - Duration::seconds(1));
        assert!(!store.put(&key(), older));
        assert_eq!(store.get(&key()).unwrap().payload(), &json!("new"));

        let newer = CacheEntry::new(json!("newer"), now + Duration::seconds(1));
        assert!(store.put(&key(), newer));
        assert_eq!(store.get(&key()).unwrap().payload(), &json!("newer"));
    }

    #[test]
    fn test_update_sees_current_payload() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.write(&key(), json!({"count": 1}), now);
        let written = store.update(&key(), now, |current| {
            let count = current
                .and_then(|e| e.payload()["count"].as_i64())
                .unwrap_or(0);
            json!({"count": count + 1})
        });
        assert_eq!(written.entry.payload(), &json!({"count": 2}));
        assert_eq!(written.previous.unwrap().payload(), &json!({"count": 1}));
    }

    #[test]
    fn test_unchanged_detection() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.write(&key(), json!({"a": 1}), now);
        assert!(store.write(&key(), json!({"a": 1}), now).unchanged());
        assert!(!store.write(&key(), json!({"a": 2}), now).unchanged());
    }

    #[test]
    fn test_invalidate_is_cleared_by_write() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(!store.invalidate(&key()));

        store.write(&key(), json!(1), now);
        assert!(store.invalidate(&key()));
        assert!(store.lookup(&key()).unwrap().1);

        store.write(&key(), json!(2), now);
        assert!(!store.lookup(&key()).unwrap().1);
    }

    #[test]
    fn test_remove_scope_leaves_other_scopes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.write(&CacheKey::new("roster", "a"), json!(1), now);
        store.write(&CacheKey::new("events", "a"), json!(2), now);
        store.write(&CacheKey::new("roster", "b"), json!(3), now);

        let mut removed = store.remove_scope("a");
        removed.sort();
        assert_eq!(
            removed,
            vec![CacheKey::new("events", "a"), CacheKey::new("roster", "a")]
        );
        assert_eq!(store.keys(), vec![CacheKey::new("roster", "b")]);

        store.clear();
        assert!(store.is_empty());
    }
}
