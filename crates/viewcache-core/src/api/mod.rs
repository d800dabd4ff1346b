//! REST client used to build resource loaders.
//!
//! `ApiClient` wraps a pooled reqwest client with bearer auth, a request
//! timeout and 429 backoff. [`ApiClient::loader`] turns an endpoint
//! template into a [`Loader`](crate::resource::Loader) for the cache.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
