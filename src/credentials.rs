//! Time-bounded cache for the web-session bearer credential.
//!
//! The cache holds at most one token. It is constructed once at startup and
//! injected into the channel handler, so tests can swap the token source.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::backends::DispatchError;
use crate::config::SettingsProvider;

/// How long a fetched token stays valid before the next `get()` refetches.
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(10);

/// Where the cache gets a fresh token from on a miss.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String, DispatchError>;
}

struct CachedCredential {
    token: String,
    fetched_at: Instant,
}

/// Process-wide credential cache.
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    // Held across the fetch, so concurrent misses collapse into one
    // upstream call.
    slot: Mutex<Option<CachedCredential>>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached token if it is less than [`CREDENTIAL_TTL`] old,
    /// otherwise fetches a fresh one and caches it.
    pub async fn get(&self) -> Result<String, DispatchError> {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if cached.fetched_at.elapsed() < CREDENTIAL_TTL {
                return Ok(cached.token.clone());
            }
        }

        let token = self.source.fetch().await?;
        *slot = Some(CachedCredential {
            token: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }

    /// Unconditionally evicts the cached token. Called by the channel
    /// handler on any non-cancellation failure, forcing the next `get()`
    /// to refetch.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Whether a token is currently cached (expired or not).
    pub async fn is_populated(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Token source for environments without an ambient cookie session: the
/// token comes from the user's settings or not at all.
pub struct ConfigTokenSource {
    settings: Arc<dyn SettingsProvider>,
}

impl ConfigTokenSource {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TokenSource for ConfigTokenSource {
    async fn fetch(&self) -> Result<String, DispatchError> {
        self.settings
            .current()
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(DispatchError::Unauthorized)
    }
}

/// Default URL of the upstream session endpoint (cookie-session
/// environments).
pub const SESSION_ENDPOINT: &str = "https://chat.openai.com/api/auth/session";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_token: Option<String>,
}

/// Token source for environments where the browser shares the chat
/// service's cookies: a GET against the session endpoint yields the token.
pub struct SessionTokenSource {
    client: reqwest::Client,
    endpoint: String,
}

impl SessionTokenSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, SESSION_ENDPOINT.to_string())
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }

    /// Map a session-endpoint response onto the error taxonomy. 403 is the
    /// anti-automation challenge; a body without a token means the user is
    /// not signed in.
    fn interpret(status: reqwest::StatusCode, body: &str) -> Result<String, DispatchError> {
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(DispatchError::Blocked);
        }
        serde_json::from_str::<SessionResponse>(body)
            .ok()
            .and_then(|response| response.access_token)
            .filter(|token| !token.is_empty())
            .ok_or(DispatchError::Unauthorized)
    }
}

#[async_trait]
impl TokenSource for SessionTokenSource {
    async fn fetch(&self) -> Result<String, DispatchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(DispatchError::backend)?;
        let status = response.status();
        let body = response.text().await.map_err(DispatchError::backend)?;
        Self::interpret(status, &body)
    }
}
