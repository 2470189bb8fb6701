//! OAuth refresh-token grant.
//!
//! Exchanges a refresh token for a new access token at a discovered token
//! endpoint (RFC 6749 section 6).

use super::RefreshError;
use serde::Deserialize;

/// Default lifetime when the provider omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3600;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Lifetime in seconds, defaulting to one hour.
    pub fn lifetime_seconds(&self) -> i64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS)
    }
}

/// Exchange a refresh token for a new access token
///
/// # Arguments
/// * `client` - HTTP client (carries the request timeout)
/// * `token_url` - OAuth token endpoint URL
/// * `refresh_token` - Decrypted refresh token
/// * `client_id` - OAuth client ID
/// * `resource` - Resource server URL the token is for
///
/// # Returns
/// * `Ok(TokenResponse)` - New access token and optional rotated refresh token
/// * `Err` - Transport failure, non-2xx response, or unparseable body
pub async fn exchange_refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
    client_id: &str,
    resource: &str,
) -> Result<TokenResponse, RefreshError> {
    let form_data = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
        ("resource", resource),
    ];

    tracing::debug!("Exchanging refresh token at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .map_err(|e| RefreshError::Transport(format!("token request failed: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(RefreshError::Rejected { status, body });
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;

    tracing::debug!(
        "Token exchange successful, rotated_refresh_token={}, expires_in={:?}",
        token_response.refresh_token.is_some(),
        token_response.expires_in
    );

    Ok(token_response)
}
