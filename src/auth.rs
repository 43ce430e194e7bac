//! Bearer token acquisition for the target FHIR server.
//!
//! - [`ClientCredentialsProvider`] performs an OAuth2 client-credentials
//!   exchange against the configured authority on every call.
//! - [`CachedTokenProvider`] wraps any provider and reuses a token until it is
//!   close to expiry. Concurrent callers share one in-flight fetch, so a pool
//!   of workers does not hammer the token endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tokens closer than this to expiry are refreshed instead of reused.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// A bearer credential for one server.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Opaque token value sent in the `Authorization` header
    pub value: String,

    /// When the authority says the token stops being valid, if it said
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Whether the token can still be used for at least `margin`.
    pub fn is_valid_for(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
                expires_at - margin > now
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors from the token exchange.
#[derive(Debug)]
pub enum AuthError {
    /// Authority could not be reached
    Request(reqwest::Error),

    /// Authority answered with a non-success status
    Rejected { status: StatusCode, body: String },

    /// Authority answered 2xx but the body is not a usable token response
    InvalidResponse(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Request(e) => write!(f, "Token request failed: {}", e),
            AuthError::Rejected { status, body } => {
                write!(f, "Authority rejected client credentials ({}): {}", status, body)
            }
            AuthError::InvalidResponse(e) => write!(f, "Invalid token response: {}", e),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Request(err)
    }
}

/// Source of bearer tokens scoped to a server resource.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a token for `resource` (the server base URL without trailing slash).
    async fn acquire(&self, resource: &str) -> Result<AuthToken, AuthError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,

    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    /// `expires_in` arrives as a number from most authorities and as a string from some.
    fn expires_in_secs(&self) -> Option<i64> {
        match self.expires_in.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Absolute expiry relative to `now`.
    ///
    /// Lifetimes too large to represent leave the token without an expiry.
    fn expires_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, AuthError> {
        let Some(secs) = self.expires_in_secs() else {
            return Ok(None);
        };
        if secs < 0 {
            return Err(AuthError::InvalidResponse(format!("negative expires_in: {}", secs)));
        }

        let expires_at =
            chrono::Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
        if expires_at.is_none() {
            warn!(expires_in = secs, "Token lifetime out of range, not caching token");
        }
        Ok(expires_at)
    }
}

/// OAuth2 client-credentials exchange against an authority.
pub struct ClientCredentialsProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentialsProvider {
    /// Create a provider for `authority`.
    ///
    /// The token endpoint is `{authority}/oauth2/token`, unless the authority
    /// URL already points at a `/token` endpoint.
    pub fn new(
        client: Client,
        authority: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_endpoint(authority),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn acquire(&self, resource: &str) -> Result<AuthToken, AuthError> {
        debug!(token_url = %self.token_url, resource = resource, "Requesting access token");

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("resource", resource),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty access_token".to_string()));
        }

        let expires_at = token.expires_at(Utc::now())?;

        Ok(AuthToken::new(token.access_token, expires_at))
    }
}

/// A token together with the resource it was issued for.
struct CachedToken {
    resource: String,
    token: AuthToken,
}

/// Reuses tokens from an inner provider until they near expiry.
///
/// Only tokens with an expiry are cached. Once the inner provider hands out a
/// token without one, fetches stop going through the shared lock so
/// concurrent callers are not serialized behind each other.
pub struct CachedTokenProvider {
    inner: Arc<dyn TokenProvider>,
    cached: Mutex<Option<CachedToken>>,
    expiring_tokens: AtomicBool,
    refresh_margin: Duration,
}

impl CachedTokenProvider {
    pub fn new(inner: Arc<dyn TokenProvider>) -> Self {
        Self::with_refresh_margin(inner, REFRESH_MARGIN)
    }

    pub fn with_refresh_margin(inner: Arc<dyn TokenProvider>, refresh_margin: Duration) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
            expiring_tokens: AtomicBool::new(true),
            refresh_margin,
        }
    }

    /// Fetch outside the lock; switches back to caching if the token has an expiry.
    async fn fetch_uncached(&self, resource: &str) -> Result<AuthToken, AuthError> {
        let token = self.inner.acquire(resource).await?;
        if token.expires_at.is_some() {
            *self.cached.lock().await = Some(CachedToken {
                resource: resource.to_string(),
                token: token.clone(),
            });
            self.expiring_tokens.store(true, Ordering::Release);
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    async fn acquire(&self, resource: &str) -> Result<AuthToken, AuthError> {
        if !self.expiring_tokens.load(Ordering::Acquire) {
            return self.fetch_uncached(resource).await;
        }

        // Held across the fetch: callers arriving mid-refresh wait for it instead of fetching too.
        let mut cached = self.cached.lock().await;

        if !self.expiring_tokens.load(Ordering::Acquire) {
            drop(cached);
            return self.fetch_uncached(resource).await;
        }

        if let Some(entry) = cached.as_ref() {
            if entry.resource == resource
                && entry.token.is_valid_for(self.refresh_margin, Utc::now())
            {
                return Ok(entry.token.clone());
            }
        }

        let token = self.inner.acquire(resource).await?;
        if token.expires_at.is_some() {
            info!(expires_at = ?token.expires_at, "Access token refreshed");
            *cached = Some(CachedToken {
                resource: resource.to_string(),
                token: token.clone(),
            });
        } else {
            debug!("Authority issues tokens without expiry, fetching per request");
            self.expiring_tokens.store(false, Ordering::Release);
            *cached = None;
        }
        Ok(token)
    }
}

fn token_endpoint(authority: &str) -> String {
    let authority = authority.trim_end_matches('/');
    if authority.ends_with("/token") {
        authority.to_string()
    } else {
        format!("{}/oauth2/token", authority)
    }
}
