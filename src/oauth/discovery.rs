//! Authorization-server metadata discovery.
//!
//! The token endpoint is learned at runtime from
//! `{origin}[/prefix]/.well-known/oauth-authorization-server`, derived from
//! the resource server URL stored with the credential.

use super::RefreshError;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Well-known metadata path (RFC 8414)
pub const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

/// Subset of the authorization-server metadata document we rely on.
#[derive(Deserialize, Debug)]
struct ServerMetadata {
    token_endpoint: String,
}

/// Derives the discovery URL for a resource server.
///
/// Scheme, host and port are kept. When the path contains one of `markers`
/// it is cut at the first marker found; otherwise the path is dropped.
///
/// # Examples
/// * `https://api.example.com` → `https://api.example.com/.well-known/oauth-authorization-server`
/// * `https://tools.example.com/v1/mcp/abc` with marker `/mcp` →
///   `https://tools.example.com/v1/.well-known/oauth-authorization-server`
pub fn discovery_url(provider_endpoint: &str, markers: &[String]) -> Result<Url, RefreshError> {
    let mut url = Url::parse(provider_endpoint).map_err(|e| {
        RefreshError::InvalidEndpoint(format!("{:?}: {}", provider_endpoint, e))
    })?;

    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(RefreshError::InvalidEndpoint(format!(
            "{:?} has no host",
            provider_endpoint
        )));
    }

    let path = url.path().to_string();
    let prefix = markers
        .iter()
        .filter(|marker| !marker.is_empty())
        .filter_map(|marker| path.find(marker.as_str()))
        .min()
        .map(|idx| path[..idx].trim_end_matches('/'))
        .unwrap_or("");

    url.set_path(&format!("{}{}", prefix, WELL_KNOWN_PATH));
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// Fetches the metadata document and returns its `token_endpoint`.
///
/// Network errors, non-2xx answers, malformed JSON and a missing field are
/// all [`RefreshError::Discovery`]. There is no retry.
pub async fn fetch_token_endpoint(
    client: &reqwest::Client,
    discovery_url: &Url,
) -> Result<String, RefreshError> {
    debug!(url = %discovery_url, "Fetching authorization server metadata");

    let response = client
        .get(discovery_url.clone())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| RefreshError::Discovery(format!("request to {} failed: {}", discovery_url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RefreshError::Discovery(format!(
            "{} returned status {}",
            discovery_url, status
        )));
    }

    let metadata: ServerMetadata = response.json().await.map_err(|e| {
        RefreshError::Discovery(format!("invalid metadata from {}: {}", discovery_url, e))
    })?;

    if metadata.token_endpoint.is_empty() {
        return Err(RefreshError::Discovery(format!(
            "{} advertised an empty token_endpoint",
            discovery_url
        )));
    }

    Ok(metadata.token_endpoint)
}
