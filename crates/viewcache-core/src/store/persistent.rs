use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::storage::StorageHandle;

/// Prefix of entry keys in shared storage.
const ENTRY_PREFIX: &str = "entry:";

/// On-disk form of a cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    payload: Value,
    hash: String,
    captured_at: DateTime<Utc>,
}

/// Serialized mirror of the memory tier in shared storage.
#[derive(Clone)]
pub struct PersistentStore {
    handle: StorageHandle,
}

impl PersistentStore {
    pub fn new(handle: StorageHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &StorageHandle {
        &self.handle
    }

    /// Read and validate an entry. Unparseable values (or values whose hash
    /// does not match their payload) are a `Serialization` error.
    pub fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(contents) = self.handle.get(&key.storage_key())? else {
            return Ok(None);
        };

        let persisted: PersistedEntry =
            serde_json::from_str(&contents).map_err(|e| CacheError::Serialization {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        CacheEntry::from_parts(persisted.payload, persisted.hash, persisted.captured_at)
            .map(Some)
            .ok_or_else(|| CacheError::Serialization {
                key: key.to_string(),
                message: "hash does not match payload".to_string(),
            })
    }

    /// Read an entry, treating anything unreadable as absent.
    ///
    /// A corrupt value is removed so the next fetch replaces it cleanly.
    pub fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.read(key) {
            Ok(entry) => entry,
            Err(e @ CacheError::Serialization { .. }) => {
                warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                if let Err(e) = self.handle.remove(&key.storage_key()) {
                    debug!(key = %key, error = %e, "Failed to remove unreadable cache entry");
                }
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache entry");
                None
            }
        }
    }

    pub fn write(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let persisted = PersistedEntry {
            payload: entry.payload().clone(),
            hash: entry.hash().to_string(),
            captured_at: entry.captured_at(),
        };
        let contents = serde_json::to_string(&persisted).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.handle.set(&key.storage_key(), &contents)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<()> {
        self.handle.remove(&key.storage_key())
    }

    /// Every entry key currently persisted.
    pub fn keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for raw in self.handle.keys()? {
            if let Some(rest) = raw.strip_prefix(ENTRY_PREFIX) {
                match rest.parse::<CacheKey>() {
                    Ok(key) => keys.push(key),
                    Err(e) => debug!(raw = %raw, error = %e, "Skipping foreign storage key"),
                }
            }
        }
        Ok(keys)
    }

    /// Map a raw storage key back to the cache key it holds, if it is one.
    pub fn parse_storage_key(raw: &str) -> Option<CacheKey> {
        raw.strip_prefix(ENTRY_PREFIX)?.parse().ok()
    }
}
