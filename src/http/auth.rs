//! Authentication for API calls
//!
//! Two modes: a static private API key, or an OAuth refresh-token flow with
//! a cached access token. Token refresh is serialized process-wide and only
//! retried when the token endpoint reports `rate_limit_exceeded`.

use crate::config::Credentials;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::http::retry::{with_retry_if, RetryPolicy};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{RwLock, Semaphore};

/// Default OAuth token endpoint
const TOKEN_URL: &str = "https://a.klaviyo.com/oauth/token";

/// Seconds of validity thrown away to absorb clock skew
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// A cached OAuth access token
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at - Duration::seconds(EXPIRY_SKEW_SECONDS)
    }
}

/// Successful token endpoint reply
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token endpoint error reply
#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Applies authentication to outgoing requests
pub struct Authenticator {
    credentials: Credentials,
    http: Client,
    token_url: String,
    cached: RwLock<Option<CachedToken>>,
    refresh_gate: Semaphore,
}

impl Authenticator {
    /// Create an authenticator sharing the client's HTTP connection pool
    pub fn new(credentials: Credentials, http: Client) -> Self {
        Self {
            credentials,
            http,
            token_url: TOKEN_URL.to_string(),
            cached: RwLock::new(None),
            refresh_gate: Semaphore::new(1),
        }
    }

    /// Override the token endpoint (tests)
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// The `Authorization` header value for the next request
    pub async fn authorization(&self, ctl: &Controller) -> Result<String> {
        match &self.credentials {
            Credentials::ApiKey { api_key } => Ok(format!("Klaviyo-API-Key {api_key}")),
            Credentials::Oauth { .. } => {
                let token = self.get_or_refresh_token(ctl).await?;
                Ok(format!("Bearer {token}"))
            }
        }
    }

    /// Get a valid token, refreshing if necessary
    async fn get_or_refresh_token(&self, ctl: &Controller) -> Result<String> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if !token.is_expired() {
                    return Ok(token.token.clone());
                }
            }
        }

        // Serialize refresh process-wide to avoid a stampede on the token
        // endpoint
        let _gate = self
            .refresh_gate
            .acquire()
            .await
            .expect("refresh gate never closed");

        // Another task may have refreshed while we waited
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if !token.is_expired() {
                    return Ok(token.token.clone());
                }
            }
        }

        let policy = RetryPolicy::token_refresh();
        let throttled = |e: &Error| {
            matches!(e, Error::TokenRefresh { code, .. } if code == "rate_limit_exceeded")
        };
        let new_token = with_retry_if(&policy, ctl, throttled, || self.fetch_token()).await?;

        let token_str = new_token.token.clone();
        *self.cached.write().await = Some(new_token);
        Ok(token_str)
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        let (client_id, client_secret, refresh_token) = match &self.credentials {
            Credentials::Oauth {
                client_id,
                client_secret,
                refresh_token,
            } => (client_id, client_secret, refresh_token),
            Credentials::ApiKey { .. } => {
                return Err(Error::auth("token refresh requires oauth credentials"))
            }
        };

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenError = serde_json::from_str(&body).unwrap_or(TokenError {
                error: "unknown".to_string(),
                error_description: None,
            });
            return Err(Error::TokenRefresh {
                code: parsed.error,
                message: parsed.error_description.unwrap_or(body),
            });
        }

        let token: TokenResponse = response.json().await.map_err(Error::Http)?;
        let expires_in = token.expires_in.unwrap_or(3600);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}
