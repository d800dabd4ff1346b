//! HTTP client for the remote JSON API backing cached resources.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::ApiError;
use crate::key::CacheKey;
use crate::resource::{loader_fn, Loader};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Placeholders substituted in endpoint templates.
const SCOPE_PLACEHOLDER: &str = "{scope}";
const RESOURCE_PLACEHOLDER: &str = "{resource}";

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidEndpoint(base_url).into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `template`, with `{scope}` and `{resource}` filled in
    /// from `key`. Absolute templates are used as-is.
    pub fn endpoint(&self, template: &str, key: &CacheKey) -> String {
        let path = template
            .replace(SCOPE_PLACEHOLDER, &key.scope)
            .replace(RESOURCE_PLACEHOLDER, &key.resource);
        if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Loader fetching `template` (see [`endpoint`](Self::endpoint)) as JSON.
    pub fn loader(&self, template: impl Into<String>) -> Loader {
        let api = self.clone();
        let template = template.into();
        loader_fn(move |key: CacheKey| {
            let api = api.clone();
            let url = api.endpoint(&template, &key);
            async move { api.get_value(&url).await }
        })
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit
    /// (should retry), or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send the request built by `build`, backing off on 429.
    async fn send<F>(&self, method: &str, url: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            debug!(method, url, "Sending request");
            let response = build(&self.client)
                .headers(self.auth_headers()?)
                .send()
                .await
                .with_context(|| format!("Failed to send {} request to {}", method, url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send("GET", url, |client| client.get(url)).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    /// GET `url` as untyped JSON, the shape loaders hand to the cache.
    pub async fn get_value(&self, url: &str) -> Result<Value> {
        self.get(url).await
    }

    /// PATCH `url` and ignore the response body. Used as the remote half of
    /// an optimistic update.
    pub async fn patch<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        self.send("PATCH", url, |client| client.patch(url).json(body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("roster", "org-1")
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(ApiClient::new("ftp://example.com").is_err());
        assert!(ApiClient::new("example.com").is_err());
    }

    #[test]
    fn test_endpoint_substitutes_placeholders() {
        let api = ApiClient::new("https://api.example.com/").unwrap();
        assert_eq!(api.base_url(), "https://api.example.com");
        assert_eq!(
            api.endpoint("/orgs/{scope}/{resource}", &key()),
            "https://api.example.com/orgs/org-1/roster"
        );
        assert_eq!(
            api.endpoint("status", &key()),
            "https://api.example.com/status"
        );
    }

    #[test]
    fn test_absolute_template_is_kept() {
        let api = ApiClient::new("https://api.example.com").unwrap();
        assert_eq!(
            api.endpoint("https://other.example.com/{scope}", &key()),
            "https://other.example.com/org-1"
        );
    }

    #[test]
    fn test_with_token_keeps_base() {
        let api = ApiClient::new("https://api.example.com").unwrap();
        let authed = api.with_token("abc".to_string());
        assert_eq!(authed.base_url(), api.base_url());
        let headers = authed.auth_headers().unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
        assert!(api.auth_headers().unwrap().get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_patch_as_optimistic_mutation() {
        use crate::{CacheError, CacheRegistry, ResourceConfig, SharedStorage};
        use serde_json::json;

        let api = ApiClient::new("http://127.0.0.1:9").unwrap();
        let registry = CacheRegistry::new(&SharedStorage::in_memory());
        registry
            .register(ResourceConfig::new("roster", api.loader("/orgs/{scope}/{resource}")))
            .unwrap();

        let partial = json!({"name": "Ana"});
        let url = api.endpoint("/orgs/{scope}/{resource}", &key());
        let err = registry
            .apply_with(&key(), partial.clone(), api.patch(&url, &partial))
            .await
            .unwrap_err();
        match err {
            CacheError::Mutation { key: failed, message } => {
                assert_eq!(failed, "roster@org-1");
                assert!(message.contains("Failed to send PATCH request"));
            }
            other => panic!("expected mutation error, got {:?}", other),
        }
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_loader_reports_unreachable_host() {
        // Port 9 (discard) on localhost refuses connections
        let api = ApiClient::new("http://127.0.0.1:9").unwrap();
        let loader = api.loader("{resource}");
        let err = loader(&key()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to send GET request"));
    }
}
