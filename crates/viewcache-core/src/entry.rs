use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::hash::ChangeHasher;

/// One immutable snapshot of a resource.
///
/// The hash is computed when the entry is built and the payload cannot be
/// changed afterwards, so a payload/hash pair always comes from the same
/// write. Cloning is cheap: the payload is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    payload: Arc<Value>,
    hash: String,
    captured_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(payload: Value, captured_at: DateTime<Utc>) -> Self {
        let hash = ChangeHasher::fingerprint(&payload);
        Self {
            payload: Arc::new(payload),
            hash,
            captured_at,
        }
    }

    /// Rebuild an entry read back from storage, rejecting it if the stored
    /// hash does not belong to the stored payload.
    pub fn from_parts(payload: Value, hash: String, captured_at: DateTime<Utc>) -> Option<Self> {
        let entry = Self::new(payload, captured_at);
        (entry.hash == hash).then_some(entry)
    }

    /// Same payload and hash, new timestamp.
    pub fn restamped(&self, captured_at: DateTime<Utc>) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            hash: self.hash.clone(),
            captured_at,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Deserialize the payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.payload.as_ref())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.captured_at
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age(now).num_minutes();
        if minutes < 1 {
            // Also covers clock skew (negative ages)
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
