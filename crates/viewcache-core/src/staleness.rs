//! Age classification of cache entries.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Use the payload, nothing else to do.
    Fresh,
    /// Use the payload now and refresh in the background.
    Stale,
    /// Wait for a refresh before showing anything.
    Expired,
}

impl Staleness {
    pub fn is_displayable(&self) -> bool {
        !matches!(self, Staleness::Expired)
    }

    pub fn needs_refresh(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

/// Two-threshold policy: younger than `fresh_ttl` is fresh, younger than
/// `stale_ttl` is stale, anything older (or missing) is expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl StalenessPolicy {
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Result<Self> {
        if fresh_ttl > stale_ttl {
            return Err(CacheError::InvalidConfig(format!(
                "fresh TTL ({:?}) exceeds stale TTL ({:?})",
                fresh_ttl, stale_ttl
            )));
        }
        Ok(Self {
            fresh_ttl,
            stale_ttl,
        })
    }

    pub fn fresh_ttl(&self) -> Duration {
        self.fresh_ttl
    }

    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }

    pub fn classify(&self, entry: Option<&CacheEntry>, now: DateTime<Utc>) -> Staleness {
        let Some(entry) = entry else {
            return Staleness::Expired;
        };
        // Negative age means the entry was stamped by a clock ahead of ours
        let age = entry.age(now).to_std().unwrap_or(Duration::ZERO);
        if age < self.fresh_ttl {
            Staleness::Fresh
        } else if age < self.stale_ttl {
            Staleness::Stale
        } else {
            Staleness::Expired
        }
    }

    /// Classification for an entry another context has told us is outdated:
    /// never better than stale.
    pub fn classify_invalidated(&self, entry: Option<&CacheEntry>, now: DateTime<Utc>) -> Staleness {
        match self.classify(entry, now) {
            Staleness::Fresh => Staleness::Stale,
            other => other,
        }
    }
}
