//! Klaviyo API client
//!
//! A thin layer over reqwest that owns authentication, the pinned API
//! revision header, response classification, and the composition of every
//! call through the retrying invoker and the per-endpoint rate limiter.

use crate::config::ConnectorConfig;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::http::auth::Authenticator;
use crate::http::rate_limit::RateLimiterRegistry;
use crate::http::retry::{with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Production API root
const BASE_URL: &str = "https://a.klaviyo.com/api";

/// Pinned API revision sent with every request
pub const REVISION: &str = "2024-10-15";

/// One page of a paginated endpoint
#[derive(Debug, Clone)]
pub struct Page {
    /// Records of this page (the top-level `data` array)
    pub data: Vec<Value>,
    /// Absolute URL of the next page, if any
    pub next: Option<Url>,
}

/// Filter expression builder.
///
/// Expressions are comma-joined at the top level, e.g.
/// `greater-or-equal(datetime,2024-05-01T00:00:00Z),less-than(datetime,...)`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    parts: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn greater_or_equal(mut self, field: &str, value: DateTime<Utc>) -> Self {
        self.parts
            .push(format!("greater-or-equal({field},{})", format_ts(value)));
        self
    }

    #[must_use]
    pub fn less_than(mut self, field: &str, value: DateTime<Utc>) -> Self {
        self.parts
            .push(format!("less-than({field},{})", format_ts(value)));
        self
    }

    #[must_use]
    pub fn equals(mut self, field: &str, value: &str) -> Self {
        self.parts.push(format!("equals({field},{value})"));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Comma-joined expression string
    pub fn build(&self) -> String {
        self.parts.join(",")
    }
}

/// ISO 8601 with a literal Z suffix, the format the filter grammar expects
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Klaviyo API client shared across streams
pub struct KlaviyoClient {
    http: Client,
    base_url: String,
    auth: Authenticator,
    limits: RateLimiterRegistry,
    retry: RetryPolicy,
}

impl KlaviyoClient {
    /// Build a client from connector configuration
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("klaviyo-source/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            auth: Authenticator::new(config.credentials.clone(), http.clone()),
            http,
            base_url: BASE_URL.to_string(),
            limits: RateLimiterRegistry::new(),
            retry: RetryPolicy::api(),
        })
    }

    /// Override the API root (tests)
    #[must_use]
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }

    /// Override the OAuth token endpoint (tests)
    #[must_use]
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.auth = self.auth.with_token_url(url);
        self
    }

    /// Override the retry profile (tests)
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the absolute URL for an API path with query parameters
    pub fn endpoint_url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{base}/{path}"))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    /// Fetch one page from a paginated endpoint.
    ///
    /// `endpoint_key` selects the rate budget; `url` is either the first-page
    /// URL built with [`Self::endpoint_url`] or the `links.next` of the
    /// previous page.
    pub async fn fetch_page(&self, ctl: &Controller, endpoint_key: &str, url: Url) -> Result<Page> {
        let body = self.get_raw(ctl, endpoint_key, url).await?;

        let data = match body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            // single-resource endpoints return an object under `data`
            Some(item @ Value::Object(_)) => vec![item.clone()],
            _ => Vec::new(),
        };

        let next = body
            .pointer("/links/next")
            .and_then(Value::as_str)
            .map(Url::parse)
            .transpose()?;

        Ok(Page { data, next })
    }

    /// Rate-limited, retried GET returning the raw JSON body
    pub async fn get(
        &self,
        ctl: &Controller,
        endpoint_key: &str,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value> {
        let url = self.endpoint_url(path, query)?;
        self.get_raw(ctl, endpoint_key, url).await
    }

    async fn get_raw(&self, ctl: &Controller, endpoint_key: &str, url: Url) -> Result<Value> {
        with_retry(&self.retry, ctl, || {
            let url = url.clone();
            async move {
                self.limits
                    .schedule(endpoint_key, ctl, || self.send_once(ctl, url))
                    .await
            }
        })
        .await
    }

    /// One dispatch: apply auth and revision, classify the response
    async fn send_once(&self, ctl: &Controller, url: Url) -> Result<Value> {
        let authorization = self.auth.authorization(ctl).await?;

        let response = self
            .http
            .get(url)
            .header("Authorization", authorization)
            .header("revision", REVISION)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                retry_after_seconds: extract_retry_after(&response),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(Error::Http)
    }

    /// Validate credentials with a single cheap request
    pub async fn check(&self, ctl: &Controller) -> Result<()> {
        match self.get(ctl, "GET:/metrics/", "/metrics/", &[]).await {
            Ok(_) => Ok(()),
            Err(Error::HttpStatus { status, body }) if status == 401 || status == 403 => {
                Err(Error::auth(format!("credentials rejected ({status}): {body}")))
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for KlaviyoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlaviyoClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Shared client handle
pub type SharedClient = Arc<KlaviyoClient>;

/// Extract the retry-after header value, defaulting to 60 seconds
fn extract_retry_after(response: &Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(60)
}
