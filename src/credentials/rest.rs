//! Credential record storage over a PostgREST-style HTTP API.
//!
//! Rows live in a single table filtered by `user_id=eq.<id>&scope=eq.<scope>`.
//! Row-level access isolation is enforced by the service, not here.

use super::{
    expiry::parse_expires_at, CredentialRecord, EncryptedSecret, RecordUpdate, Scope, ScopeKey,
    SecretStore, StoreError, DEFAULT_TOKEN_TYPE,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// REST secret store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RestStoreConfig {
    /// Service base URL (e.g. "https://project.supabase.co")
    pub url: String,

    /// Service key sent as `apikey` and bearer token
    #[serde(default)]
    pub service_key: Option<String>,

    /// Table holding credential rows
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

pub(crate) fn default_table() -> String {
    "user_credentials".to_string()
}

pub(crate) fn default_request_timeout() -> u64 {
    10
}

/// Row shape returned by the REST API.
#[derive(Deserialize)]
struct CredentialRow {
    access_token: String,
    refresh_token: String,
    expires_at: String,
    #[serde(default)]
    token_type: Option<String>,
    provider_endpoint: String,
}

#[derive(Deserialize)]
struct ScopeRow {
    scope: String,
}

/// Secret store client for a PostgREST-compatible service.
pub struct RestSecretStore {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
}

impl RestSecretStore {
    /// Builds a client for the configured service.
    ///
    /// # Returns
    /// * `Err(StoreError::Unavailable)` - Missing service key or HTTP client setup failure
    pub fn new(config: &RestStoreConfig) -> Result<Self, StoreError> {
        let service_key = config
            .service_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StoreError::Unavailable("service key is not configured".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.url.trim_end_matches('/'),
                config.table
            ),
            service_key,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header(header::ACCEPT, "application/json")
    }

    fn key_filter(key: &ScopeKey) -> [(&'static str, String); 2] {
        [
            ("user_id", format!("eq.{}", key.user_id)),
            ("scope", format!("eq.{}", key.scope.as_key())),
        ]
    }

    /// PATCHes the row and returns how many rows matched.
    async fn patch(
        &self,
        key: &ScopeKey,
        expected_refresh_token: Option<&EncryptedSecret>,
        update: &RecordUpdate,
    ) -> Result<usize, StoreError> {
        key.validate()?;

        let mut body = Map::new();
        if let Some(token) = &update.access_token {
            body.insert("access_token".to_string(), json!(token.as_str()));
        }
        if let Some(token) = &update.refresh_token {
            body.insert("refresh_token".to_string(), json!(token.as_str()));
        }
        if let Some(expires_at) = update.expires_at {
            body.insert("expires_at".to_string(), json!(expires_at.to_rfc3339()));
        }
        if let Some(token_type) = &update.token_type {
            body.insert("token_type".to_string(), json!(token_type));
        }
        body.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));

        let mut request = self
            .authorized(self.client.patch(&self.endpoint))
            .header("Prefer", "return=representation")
            .query(&Self::key_filter(key));
        if let Some(expected) = expected_refresh_token {
            request = request.query(&[("refresh_token", format!("eq.{}", expected.as_str()))]);
        }

        let response = send(request.json(&Value::Object(body)), "update").await?;
        let rows: Vec<Value> = parse_json(response, "update").await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl SecretStore for RestSecretStore {
    async fn get_record(&self, key: &ScopeKey) -> Result<Option<CredentialRecord>, StoreError> {
        key.validate()?;

        let request = self
            .authorized(self.client.get(&self.endpoint))
            .query(&Self::key_filter(key))
            .query(&[("select", "*"), ("limit", "1")]);

        let response = send(request, "lookup").await?;
        let rows: Vec<CredentialRow> = parse_json(response, "lookup").await?;

        let Some(row) = rows.into_iter().next() else {
            debug!(key = %key, "No credential record");
            return Ok(None);
        };

        let expires_at = parse_expires_at(&row.expires_at).map_err(|e| {
            StoreError::Corrupt(format!("{}: invalid expires_at {:?}: {}", key, row.expires_at, e))
        })?;

        Ok(Some(CredentialRecord {
            access_token: EncryptedSecret::from_stored(row.access_token),
            refresh_token: EncryptedSecret::from_stored(row.refresh_token),
            expires_at,
            token_type: row
                .token_type
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            provider_endpoint: row.provider_endpoint,
        }))
    }

    async fn update_record(&self, key: &ScopeKey, update: &RecordUpdate) -> Result<(), StoreError> {
        match self.patch(key, None, update).await? {
            0 => Err(StoreError::RecordMissing(key.to_string())),
            _ => Ok(()),
        }
    }

    async fn compare_and_update(
        &self,
        key: &ScopeKey,
        expected_refresh_token: &EncryptedSecret,
        update: &RecordUpdate,
    ) -> Result<bool, StoreError> {
        let rows = self.patch(key, Some(expected_refresh_token), update).await?;
        Ok(rows > 0)
    }

    async fn put_record(&self, key: &ScopeKey, record: &CredentialRecord) -> Result<(), StoreError> {
        key.validate()?;

        let body = json!({
            "user_id": key.user_id,
            "scope": key.scope.as_key(),
            "access_token": record.access_token.as_str(),
            "refresh_token": record.refresh_token.as_str(),
            "expires_at": record.expires_at.to_rfc3339(),
            "token_type": record.token_type,
            "provider_endpoint": record.provider_endpoint,
            "updated_at": Utc::now().to_rfc3339(),
        });

        let request = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", "user_id,scope")])
            .json(&body);

        send(request, "upsert").await?;
        Ok(())
    }

    async fn delete_record(&self, key: &ScopeKey) -> Result<bool, StoreError> {
        key.validate()?;

        let request = self
            .authorized(self.client.delete(&self.endpoint))
            .header("Prefer", "return=representation")
            .query(&Self::key_filter(key));

        let response = send(request, "delete").await?;
        let rows: Vec<Value> = parse_json(response, "delete").await?;
        Ok(!rows.is_empty())
    }

    async fn list_scopes(&self, user_id: &str) -> Result<Vec<Scope>, StoreError> {
        if user_id.is_empty() {
            return Err(StoreError::InvalidKey("user_id is empty".to_string()));
        }

        let request = self
            .authorized(self.client.get(&self.endpoint))
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                ("select", "scope".to_string()),
                ("order", "scope.asc".to_string()),
            ]);

        let response = send(request, "list").await?;
        let rows: Vec<ScopeRow> = parse_json(response, "list").await?;

        rows.into_iter()
            .map(|row| {
                Scope::from_key(&row.scope)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown scope {:?}", row.scope)))
            })
            .collect()
    }
}

/// Sends a request; transport failures and non-2xx answers are both
/// "store unavailable".
async fn send(request: RequestBuilder, operation: &str) -> Result<Response, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|e| StoreError::Unavailable(format!("{} request failed: {}", operation, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(StoreError::Unavailable(format!(
            "{} failed with status {}: {}",
            operation, status, body
        )));
    }

    Ok(response)
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: Response,
    operation: &str,
) -> Result<T, StoreError> {
    response
        .json()
        .await
        .map_err(|e| StoreError::Corrupt(format!("failed to parse {} response: {}", operation, e)))
}
