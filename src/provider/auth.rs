//! Provider credential lifecycle: API key in, short-lived bearer token out.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ProviderConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::ExternalToken;
use crate::store::TokenStore;

type PendingRefresh = Shared<BoxFuture<'static, SyncResult<String>>>;

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
    #[serde(rename = "expiresInSeconds", default)]
    expires_in_seconds: Option<i64>,
}

/// Hands out provider tokens, refreshing through a single shared in-flight
/// exchange. Cheap to clone; clones share the cache and the pending refresh.
#[derive(Clone)]
pub struct AuthTokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    store: Arc<dyn TokenStore>,
    grace: Duration,
    default_ttl_secs: i64,
    pending: Mutex<Option<PendingRefresh>>,
}

impl AuthTokenManager {
    pub fn new(config: &ProviderConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: Client::new(),
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: config.resolve_api_key(),
                store,
                grace: Duration::seconds(config.token_grace_secs),
                default_ttl_secs: config.default_token_ttl_secs,
                pending: Mutex::new(None),
            }),
        }
    }

    /// The configured API key, or a configuration error when absent
    pub fn api_key(&self) -> SyncResult<&str> {
        self.inner.api_key()
    }

    /// Return a token that stays valid for at least the grace window
    #[instrument(skip(self))]
    pub async fn get_valid_token(&self) -> SyncResult<String> {
        self.inner.api_key()?;

        if let Some(token) = self.inner.fresh_stored_token().await? {
            debug!("Using stored provider token");
            return Ok(token);
        }

        self.refresh(false).await
    }

    /// Exchange a new token even if the stored one looks valid
    #[instrument(skip(self))]
    pub async fn force_refresh(&self) -> SyncResult<String> {
        self.inner.api_key()?;
        self.refresh(true).await
    }

    async fn refresh(&self, force: bool) -> SyncResult<String> {
        let pending = {
            let mut slot = self.inner.pending.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    // Another caller may have refreshed between our store read and the lock
                    if !force {
                        if let Some(token) = self.inner.fresh_stored_token().await? {
                            return Ok(token);
                        }
                    }

                    let inner = Arc::clone(&self.inner);
                    let pending = async move { inner.exchange().await }.boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.inner.pending.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }

        result
    }
}

impl Inner {
    fn api_key(&self) -> SyncResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| SyncError::Configuration("provider API key is not configured".to_string()))
    }

    async fn fresh_stored_token(&self) -> SyncResult<Option<String>> {
        let stored = self.store.current_token().await?;
        Ok(stored
            .filter(|token| token.is_fresh_at(Utc::now(), self.grace))
            .map(|token| token.token))
    }

    async fn exchange(&self) -> SyncResult<String> {
        let api_key = self.api_key()?;
        let url = format!("{}/apikeys/CreateApiKey", self.base_url);

        info!("Exchanging API key for a provider token");

        let response = self
            .client
            .post(&url)
            .json(&ExchangeRequest { token: api_key })
            .send()
            .await
            .map_err(|e| SyncError::UpstreamUnavailable(format!("Token request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Provider rejected the API key");
            return Err(SyncError::UpstreamAuth(format!(
                "token exchange returned {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::UpstreamUnavailable(format!(
                "token exchange returned {}: {}",
                status, body
            )));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidPayload(format!("token response: {}", e)))?;

        let ttl = body
            .expires_in_seconds
            .filter(|secs| *secs > 0)
            .unwrap_or(self.default_ttl_secs);
        let token = ExternalToken::new(body.auth_token, ttl);

        self.store.replace_token(&token).await?;

        info!(expires_at = %token.expires_at, "Stored new provider token");

        Ok(token.token)
    }
}
