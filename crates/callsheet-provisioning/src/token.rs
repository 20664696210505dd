//! Access tokens per audience.
//!
//! Token acquisition itself is a black box behind [`TokenSource`]. The
//! [`TokenCache`] is owned by one provisioning session, so concurrent installer
//! sessions never share credentials; within a session, lookups take a read lock
//! and acquisition is serialised behind the write lock.

use crate::error::{ProvisioningError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

/// A bearer token for one audience.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The raw token.
    pub value: String,
    /// When the token stops being valid, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    /// A token without a known expiry.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), expires_at: None }
    }

    /// A token that expires at `expires_at`.
    #[must_use]
    pub fn expiring(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self { value: value.into(), expires_at: Some(expires_at) }
    }

    /// Whether the token can still be used at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) > now)
    }
}

/// Obtains access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Acquires a token for `audience`.
    async fn acquire(&self, audience: &str) -> Result<AccessToken>;
}

/// Serves pre-issued tokens, per audience with an optional fallback.
#[derive(Default)]
pub struct StaticTokenSource {
    tokens: HashMap<String, String>,
    fallback: Option<String>,
}

impl StaticTokenSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for one audience.
    #[must_use]
    pub fn with_token(mut self, audience: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(audience.into(), token.into());
        self
    }

    /// Sets the token used for audiences without their own.
    #[must_use]
    pub fn with_fallback(mut self, token: impl Into<String>) -> Self {
        self.fallback = Some(token.into());
        self
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn acquire(&self, audience: &str) -> Result<AccessToken> {
        self.tokens
            .get(audience)
            .or(self.fallback.as_ref())
            .map(AccessToken::new)
            .ok_or_else(|| ProvisioningError::Token {
                audience: audience.to_string(),
                message: "no token configured".to_string(),
            })
    }
}

/// Per-session token cache keyed by audience.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    tokens: RwLock<HashMap<String, AccessToken>>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("audiences", &self.tokens.try_read().map(|t| t.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Creates an empty cache in front of `source`.
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source, tokens: RwLock::new(HashMap::new()) }
    }

    /// Returns a fresh token for `audience`, acquiring one if needed.
    pub async fn token(&self, audience: &str) -> Result<AccessToken> {
        {
            let tokens = self.tokens.read().await;
            if let Some(token) = tokens.get(audience).filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.clone());
            }
        }

        let mut tokens = self.tokens.write().await;
        // Another caller may have refreshed it while we waited for the lock.
        if let Some(token) = tokens.get(audience).filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.clone());
        }

        debug!(audience = %audience, "Acquiring access token");
        let token = self.source.acquire(audience).await?;
        tokens.insert(audience.to_string(), token.clone());
        Ok(token)
    }

    /// Drops the cached token for `audience` (e.g. after a 401).
    pub async fn invalidate(&self, audience: &str) {
        self.tokens.write().await.remove(audience);
    }

    /// Number of cached audiences.
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    /// Whether nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}
