//! Authorised HTTP access to the provisioning APIs.

use crate::error::{ProvisioningError, Result};
use crate::poll::{PollReading, PollSource, retry_after};
use crate::token::{TokenCache, TokenSource};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Base URLs, API versions and token audiences of the provisioning APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Azure Resource Manager.
    pub arm_url: String,
    /// ARM `api-version` for resource groups and deployments.
    pub arm_api_version: String,
    /// Token audience for ARM.
    pub arm_audience: String,
    /// PowerApps / Business Application Platform admin API.
    pub powerapps_url: String,
    /// `api-version` for the admin API.
    pub powerapps_api_version: String,
    /// Token audience for the admin API.
    pub powerapps_audience: String,
    /// LUIS authoring endpoint.
    pub luis_url: String,
    /// Token audience for LUIS authoring.
    pub luis_audience: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            arm_url: "https://management.azure.com".to_string(),
            arm_api_version: "2021-04-01".to_string(),
            arm_audience: "https://management.azure.com/".to_string(),
            powerapps_url: "https://api.bap.microsoft.com".to_string(),
            powerapps_api_version: "2020-10-01".to_string(),
            powerapps_audience: "https://service.powerapps.com/".to_string(),
            luis_url: "https://westus.api.cognitive.microsoft.com".to_string(),
            luis_audience: "https://cognitiveservices.azure.com/".to_string(),
        }
    }
}

impl Endpoints {
    /// Points every API at one base URL. Used against local mock servers.
    #[must_use]
    pub fn all_at(base_url: &str) -> Self {
        Self {
            arm_url: base_url.to_string(),
            powerapps_url: base_url.to_string(),
            luis_url: base_url.to_string(),
            ..Self::default()
        }
    }
}

/// A response with its body already read.
#[derive(Debug, Clone)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Parsed body (`Null` when empty, a string when not JSON).
    pub body: Value,
}

impl HttpReply {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-success reply into [`ProvisioningError::Request`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let phrase = StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown Status");
        let reason = match self.body.pointer("/error/message").and_then(Value::as_str) {
            Some(message) => format!("{phrase}: {message}"),
            None => phrase.to_string(),
        };
        Err(ProvisioningError::Request { status: self.status, reason })
    }

    /// The reply as a poll reading.
    pub fn reading(&self) -> PollReading {
        PollReading {
            status: self.status,
            body: self.body.clone(),
            retry_after: retry_after(&self.headers),
        }
    }
}

/// One installer session: HTTP client, token cache and endpoints.
#[derive(Debug)]
pub struct ProvisioningSession {
    http: Client,
    tokens: TokenCache,
    endpoints: Endpoints,
}

impl ProvisioningSession {
    /// Creates a session.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(source: Arc<dyn TokenSource>, endpoints: Endpoints) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("callsheet/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(100))
            .build()?;
        Ok(Self { http, tokens: TokenCache::new(source), endpoints })
    }

    /// The configured endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The session's token cache.
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Sends an authorised request and reads the reply.
    ///
    /// Non-success statuses are returned as replies, not errors; use
    /// [`HttpReply::error_for_status`] where they should fail.
    pub async fn send(
        &self,
        audience: &str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<HttpReply> {
        let token = self.tokens.token(audience).await?;
        debug!(method = %method, url = %url, "Sending provisioning request");

        let mut request = self.http.request(method.clone(), url).bearer_auth(&token.value);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            error!(method = %method, url = %url, error = %e, "Provisioning request failed");
            e
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status == StatusCode::UNAUTHORIZED.as_u16() {
            self.tokens.invalidate(audience).await;
        }
        debug!(url = %url, status, "Provisioning response");
        Ok(HttpReply { status, headers, body })
    }
}

/// Polls tracking URIs through a session.
#[derive(Debug, Clone)]
pub struct SessionPollSource {
    session: Arc<ProvisioningSession>,
    audience: String,
}

impl SessionPollSource {
    /// Creates a poll source using `audience`'s token.
    #[must_use]
    pub fn new(session: Arc<ProvisioningSession>, audience: impl Into<String>) -> Self {
        Self { session, audience: audience.into() }
    }
}

#[async_trait]
impl PollSource for SessionPollSource {
    async fn poll(&self, url: &str) -> Result<PollReading> {
        let reply = self.session.send(&self.audience, Method::GET, url, None).await?;
        Ok(reply.reading())
    }
}
