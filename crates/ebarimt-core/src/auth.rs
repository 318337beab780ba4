//! OAuth2 password-grant tokens for the ITC services.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::error::ClientError;
use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::timestamp::UtcDateTime;

pub const TOKEN_CACHE_KEY: &str = "ebarimt_itc_token";
const CLIENT_ID: &str = "vatps";
const DEFAULT_EXPIRES_IN: u64 = 300;
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// API username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Token as kept under [`TOKEN_CACHE_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: UtcDateTime,
    pub token_type: String,
}

impl CachedToken {
    /// Usable only until `EXPIRY_BUFFER` before it expires.
    fn is_fresh(&self) -> bool {
        UtcDateTime::now().saturating_add(EXPIRY_BUFFER) < self.expires_at
    }
}

pub struct TokenProvider {
    http: Arc<dyn HttpClient>,
    cache: Arc<dyn Cache>,
    token_urls: Vec<String>,
    credentials: Option<Credentials>,
    timeout_ms: u64,
}

impl TokenProvider {
    /// `token_urls` are tried in order; the first is the primary.
    pub fn new(
        http: Arc<dyn HttpClient>,
        cache: Arc<dyn Cache>,
        token_urls: Vec<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            http,
            cache,
            token_urls,
            credentials,
            timeout_ms: 30_000,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn token_urls(&self) -> &[String] {
        &self.token_urls
    }

    /// Cached token when still fresh, otherwise a newly granted one.
    pub async fn token(&self, force_refresh: bool) -> Result<String, ClientError> {
        if !force_refresh {
            if let Some(token) = self.cached().await {
                return Ok(token.access_token);
            }
        }
        self.acquire().await
    }

    pub async fn auth(&self) -> Result<HttpAuth, ClientError> {
        Ok(HttpAuth::BearerToken(self.token(false).await?))
    }

    /// Drop the cached token.
    pub async fn clear(&self) {
        if let Err(error) = self.cache.delete(TOKEN_CACHE_KEY).await {
            tracing::warn!(%error, "failed to clear cached token");
        }
    }

    async fn cached(&self) -> Option<CachedToken> {
        let value = match self.cache.get(TOKEN_CACHE_KEY).await {
            Ok(value) => value?,
            Err(error) => {
                tracing::warn!(%error, "token cache unavailable");
                return None;
            }
        };
        serde_json::from_value::<CachedToken>(value)
            .ok()
            .filter(CachedToken::is_fresh)
    }

    async fn acquire(&self) -> Result<String, ClientError> {
        let Some(credentials) = &self.credentials else {
            return Err(ClientError::Auth(
                "eBarimt API credentials are not configured".to_owned(),
            ));
        };

        let body = format!(
            "grant_type=password&client_id={CLIENT_ID}&username={}&password={}",
            urlencoding::encode(&credentials.username),
            urlencoding::encode(&credentials.password)
        );

        let mut last_error = String::from("no token endpoints configured");
        for url in &self.token_urls {
            let request = HttpRequest::post(url.clone())
                .with_header("content-type", "application/x-www-form-urlencoded")
                .with_body(body.clone())
                .with_timeout_ms(self.timeout_ms);

            let response = match self.http.execute(request).await {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(%url, %error, "token endpoint unreachable");
                    last_error = format!("{url}: {error}");
                    continue;
                }
            };

            match response.status {
                200 => {
                    let grant: TokenGrant = response.json().map_err(|error| {
                        ClientError::InvalidResponse(format!("token response: {error}"))
                    })?;
                    let token = self.remember(grant).await;
                    tracing::debug!(%url, "token acquired");
                    return Ok(token);
                }
                401 => {
                    return Err(ClientError::Auth(
                        "invalid eBarimt credentials, check username and password".to_owned(),
                    ));
                }
                status => {
                    last_error = format!("{url}: HTTP {status}");
                }
            }
        }

        Err(ClientError::Auth(format!(
            "failed to acquire eBarimt token: {last_error}"
        )))
    }

    async fn remember(&self, grant: TokenGrant) -> String {
        let expires_in = Duration::from_secs(grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
        let cached = CachedToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: UtcDateTime::now().saturating_add(expires_in),
            token_type: grant.token_type.unwrap_or_else(|| "Bearer".to_owned()),
        };

        match serde_json::to_value(&cached) {
            Ok(value) => {
                if let Err(error) = self
                    .cache
                    .set(TOKEN_CACHE_KEY, value, Some(expires_in))
                    .await
                {
                    tracing::warn!(%error, "failed to cache token");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to encode token"),
        }
        cached.access_token
    }
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("token_urls", &self.token_urls)
            .field("credentials", &self.credentials)
            .field("cache", &self.cache.name())
            .finish()
    }
}
