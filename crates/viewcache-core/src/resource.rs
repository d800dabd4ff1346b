//! Per-resource registration: loader, declared schema, TTLs, polling.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::staleness::StalenessPolicy;

/// Default time an entry is served without any refresh.
/// One minute keeps views snappy while still picking up edits made elsewhere.
pub const DEFAULT_FRESH_TTL: Duration = Duration::from_secs(60);

/// Default age after which an entry is no longer shown without a refresh.
/// An hour balances offline usefulness with showing outdated data.
pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(60 * 60);

pub type LoadFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Fetches the authoritative value of a resource for the given key.
pub type Loader = Arc<dyn Fn(&CacheKey) -> LoadFuture + Send + Sync>;

/// Build a [`Loader`] from an async closure returning raw JSON.
pub fn loader_fn<F, Fut>(f: F) -> Loader
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |key: &CacheKey| f(key.clone()).boxed())
}

/// Build a [`Loader`] from an async closure returning a typed value.
pub fn typed_loader<T, F, Fut>(f: F) -> Loader
where
    T: Serialize,
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |key: &CacheKey| {
        let fut = f(key.clone());
        async move {
            let value = serde_json::to_value(fut.await?)?;
            Ok::<Value, anyhow::Error>(value)
        }
        .boxed()
    })
}

/// Declared response shape of a resource.
///
/// Normalization runs once at the loader boundary: the raw response is
/// parsed into the declared type and serialized back, so stored payloads
/// always have the declared shape. A mismatch is a load failure.
#[derive(Clone, Copy)]
pub struct Schema {
    name: &'static str,
    normalize: fn(Value) -> serde_json::Result<Value>,
}

fn pass_through(value: Value) -> serde_json::Result<Value> {
    Ok(value)
}

fn normalize_as<T: Serialize + DeserializeOwned>(value: Value) -> serde_json::Result<Value> {
    let typed: T = serde_json::from_value(value)?;
    serde_json::to_value(typed)
}

impl Schema {
    /// Accept any JSON value as-is.
    pub fn any() -> Self {
        Self {
            name: "any",
            normalize: pass_through,
        }
    }

    pub fn of<T: Serialize + DeserializeOwned>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            normalize: normalize_as::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn normalize(&self, resource: &str, value: Value) -> Result<Value> {
        (self.normalize)(value).map_err(|e| CacheError::Shape {
            resource: resource.to_string(),
            message: format!("expected {}: {}", self.name, e),
        })
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Schema").field(&self.name).finish()
    }
}

/// Everything the engine needs to know about one resource.
#[derive(Clone)]
pub struct ResourceConfig {
    pub name: String,
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub poll_interval: Option<Duration>,
    /// Announce writes to other contexts.
    pub broadcast: bool,
    /// Publish writes whose payload hash did not change.
    pub publish_unchanged: bool,
    pub schema: Schema,
    pub loader: Loader,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, loader: Loader) -> Self {
        Self {
            name: name.into(),
            fresh_ttl: DEFAULT_FRESH_TTL,
            stale_ttl: DEFAULT_STALE_TTL,
            poll_interval: None,
            broadcast: true,
            publish_unchanged: true,
            schema: Schema::any(),
            loader,
        }
    }

    pub fn ttl(mut self, fresh: Duration, stale: Duration) -> Self {
        self.fresh_ttl = fresh;
        self.stale_ttl = stale;
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Keep writes to this context; other contexts are never told.
    pub fn local_only(mut self) -> Self {
        self.broadcast = false;
        self
    }

    /// Skip publication when a write leaves the payload unchanged.
    pub fn skip_unchanged(mut self) -> Self {
        self.publish_unchanged = false;
        self
    }

    pub fn policy(&self) -> Result<StalenessPolicy> {
        StalenessPolicy::new(self.fresh_ttl, self.stale_ttl)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidConfig("resource name is empty".to_string()));
        }
        if self.poll_interval == Some(Duration::ZERO) {
            return Err(CacheError::InvalidConfig(format!(
                "poll interval for {} must be non-zero",
                self.name
            )));
        }
        self.policy().map(|_| ())
    }

    pub fn load(&self, key: &CacheKey) -> LoadFuture {
        (self.loader)(key)
    }
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("name", &self.name)
            .field("fresh_ttl", &self.fresh_ttl)
            .field("stale_ttl", &self.stale_ttl)
            .field("poll_interval", &self.poll_interval)
            .field("broadcast", &self.broadcast)
            .field("publish_unchanged", &self.publish_unchanged)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
