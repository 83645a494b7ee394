//! Access token management
//!
//! The token is loaded from disk at startup, validated against its `exp`
//! claim and then refreshed in the background:
//! 1. Sleep until `expiry - REFRESH_BUFFER`
//! 2. `POST /auth/token?grant_type=token` with the current bearer
//! 3. Persist and publish the new token, reschedule from its expiry
//!
//! The manager is the only writer of the shared [`TokenHandle`]; every HTTP
//! request reads it on each attempt.

use crate::client::CoordinatorClient;
use crate::state::TokenStore;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Refresh this long before the token expires
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Retry budget for a refresh request
const REFRESH_MAX_RETRIES: u32 = 10;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no access token found, run `emrys login` first")]
    Missing,
    #[error("malformed access token: {0}")]
    Malformed(String),
    #[error("access token expired at {0}, run `emrys login` again")]
    Expired(DateTime<Utc>),
    #[error("token storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared, atomically swappable bearer token
#[derive(Clone)]
pub struct TokenHandle(Arc<RwLock<Arc<str>>>);

impl TokenHandle {
    pub fn new(token: String) -> Self {
        Self(Arc::new(RwLock::new(Arc::from(token))))
    }

    /// Current token. Readers always see a whole token, never a torn one.
    pub fn get(&self) -> Arc<str> {
        self.0.read().clone()
    }

    pub fn set(&self, token: String) {
        *self.0.write() = Arc::from(token);
    }

    /// Zero the published token at shutdown.
    pub fn clear(&self) {
        *self.0.write() = Arc::from("");
    }
}

impl Default for TokenHandle {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl std::fmt::Debug for TokenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenHandle(..)")
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim without verifying the signature.
pub fn expiry(token: &str) -> Result<DateTime<Utc>, TokenError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| TokenError::Malformed("expected three dot-separated parts".to_string()))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let claims: Claims =
        serde_json::from_slice(&decoded).map_err(|e| TokenError::Malformed(e.to_string()))?;
    DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| TokenError::Malformed(format!("exp out of range: {}", claims.exp)))
}

/// Validate a token for use at `now`: it must not be inside the refresh buffer.
pub fn validate(token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
    if token.trim().is_empty() {
        return Err(TokenError::Missing);
    }
    let exp = expiry(token)?;
    if now + buffer() >= exp {
        return Err(TokenError::Expired(exp));
    }
    Ok(exp)
}

/// How long to wait before refreshing a token expiring at `exp`.
pub fn refresh_delay(exp: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (exp - buffer() - now).to_std().unwrap_or(Duration::ZERO)
}

fn buffer() -> chrono::Duration {
    chrono::Duration::from_std(REFRESH_BUFFER).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

/// Background refresher for the shared token
pub struct TokenManager {
    client: CoordinatorClient,
    store: TokenStore,
}

impl TokenManager {
    pub fn new(client: CoordinatorClient, store: TokenStore) -> Self {
        Self { client, store }
    }

    /// Refresh forever. On permanent failure `shutdown` is triggered, since
    /// every other task will start failing once the token lapses.
    pub async fn run(self, cancel: CancellationToken, shutdown: CancellationToken) {
        let handle = self.client.transport().token().clone();
        let mut exp = match expiry(&handle.get()) {
            Ok(exp) => exp,
            Err(e) => {
                error!("Cannot schedule token refresh: {}", e);
                shutdown.cancel();
                return;
            }
        };

        loop {
            let delay = refresh_delay(exp, Utc::now());
            info!("Next token refresh in {}s", delay.as_secs());

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.refresh_once(&cancel).await {
                Ok(new_exp) => {
                    exp = new_exp;
                    info!("Access token refreshed, expires at {}", exp);
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    error!("Token refresh failed, shutting down: {:#}", e);
                    shutdown.cancel();
                    return;
                }
            }
        }
    }

    /// Perform one refresh cycle: request, persist, publish.
    pub async fn refresh_once(&self, cancel: &CancellationToken) -> anyhow::Result<DateTime<Utc>> {
        let token = self
            .client
            .refresh_token(cancel, REFRESH_MAX_RETRIES)
            .await?;
        let exp = expiry(&token)?;

        if let Err(e) = self.store.save(&token) {
            warn!("Failed to persist refreshed token: {}", e);
        }
        self.client.transport().token().set(token);
        Ok(exp)
    }
}
