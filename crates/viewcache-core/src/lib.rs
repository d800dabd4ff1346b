//! Client-side cache and sync engine for remote API resources.
//!
//! Views read through a [`CacheRegistry`], which keeps one entry per
//! [`CacheKey`] in memory, mirrors it to [`SharedStorage`] and classifies it
//! as fresh, stale or expired on every read. Refreshes are deduplicated per
//! key, optimistic edits are reconciled against the server, and other
//! contexts sharing the same storage are told when an entry changes.

pub mod api;
pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod key;
pub mod optimistic;
pub mod polling;
pub mod registry;
pub mod resource;
pub mod staleness;
pub mod storage;
pub mod store;
mod write;

pub use api::{ApiClient, ApiError};
pub use bus::{IntraContextBus, Subscription};
pub use channel::{CrossContextChannel, InvalidationSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ResourcePolicy};
pub use entry::CacheEntry;
pub use error::{CacheError, Result};
pub use key::CacheKey;
pub use registry::{CacheRegistry, Snapshot};
pub use resource::{loader_fn, typed_loader, Loader, ResourceConfig, Schema};
pub use staleness::{Staleness, StalenessPolicy};
pub use storage::{SharedStorage, StorageHandle};
