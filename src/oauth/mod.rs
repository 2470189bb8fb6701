//! OAuth refresh-token protocol.
//!
//! ```text
//! provider_endpoint ──► discovery_url ──► GET metadata ──► token_endpoint
//!                                                              │
//!           refresh_token ──► POST grant_type=refresh_token ◄──┘
//!                                        │
//!                                  TokenResponse
//! ```
//!
//! Every step is a single attempt: there is no retry or backoff, and any
//! failure ends the refresh. Persisting the result is the resolver's job.

pub mod discovery;
pub mod exchange;

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use discovery::{discovery_url, fetch_token_endpoint};
pub use exchange::{exchange_refresh_token, TokenResponse, DEFAULT_EXPIRES_IN_SECONDS};

/// OAuth client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Client identifier sent with every refresh grant
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Timeout applied to discovery and token requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Path markers after which a provider endpoint's path is cut before
    /// appending the well-known discovery path
    #[serde(default = "default_discovery_path_markers")]
    pub discovery_path_markers: Vec<String>,
}

fn default_client_id() -> String {
    "tokenvault".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_discovery_path_markers() -> Vec<String> {
    vec!["/mcp".to_string(), "/sse".to_string()]
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            request_timeout_seconds: default_request_timeout(),
            discovery_path_markers: default_discovery_path_markers(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// Stored provider endpoint is not an absolute URL with a host
    #[error("Invalid provider endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Authorization server discovery failed: {0}")]
    Discovery(String),

    /// Token endpoint answered with a non-2xx status
    #[error("Token refresh rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Network error or timeout talking to the token endpoint
    #[error("Token refresh transport error: {0}")]
    Transport(String),

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),
}

/// Performs discovery + exchange for one refresh attempt.
#[derive(Clone)]
pub struct TokenRefresher {
    http_client: reqwest::Client,
    config: OAuthConfig,
}

impl TokenRefresher {
    pub fn new(config: OAuthConfig) -> Result<Self, RefreshError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| RefreshError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Runs discovery and the refresh grant against `provider_endpoint`.
    ///
    /// # Arguments
    /// * `refresh_token` - Decrypted refresh token (sent only to the token endpoint)
    /// * `provider_endpoint` - Resource server URL stored with the credential
    pub async fn refresh(
        &self,
        refresh_token: &str,
        provider_endpoint: &str,
    ) -> Result<TokenResponse, RefreshError> {
        let discovery = discovery_url(provider_endpoint, &self.config.discovery_path_markers)?;
        let token_endpoint = fetch_token_endpoint(&self.http_client, &discovery).await?;

        debug!(
            provider_endpoint = %provider_endpoint,
            token_endpoint = %token_endpoint,
            "Discovered token endpoint"
        );

        let response = exchange_refresh_token(
            &self.http_client,
            &token_endpoint,
            refresh_token,
            &self.config.client_id,
            provider_endpoint,
        )
        .await?;

        info!(
            provider_endpoint = %provider_endpoint,
            expires_in = response.lifetime_seconds(),
            "OAuth token refreshed"
        );

        Ok(response)
    }
}
