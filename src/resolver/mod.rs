//! Credential resolution for agents.
//!
//! Agents call [`CredentialResolver::resolve`] before every outbound API call.
//! Scopes are tried in strict order with no merging:
//!
//! ```text
//! Global ──(valid)──────────────► Resolved
//!   │ (expired) ──refresh──ok───► Resolved
//!   │ (missing / failed)
//!   ▼
//! Agent(agent_id) ── same steps ─► Resolved
//!   │
//!   ▼
//! NotConfigured | TransientFailure
//! ```

mod locks;


pub use locks::{RefreshGuard, RefreshLocks};

use crate::config::{ConfigError, StoreConfig, VaultConfig};
use crate::credentials::expiry::MAX_LIFETIME_SECONDS;
use crate::credentials::{
    CodecError, CredentialRecord, ExpiryPolicy, RecordUpdate, ResolvedCredential,
    RestSecretStore, Scope, ScopeKey, SecretCodec, SecretStore, SqliteSecretStore, StoreError,
};
use crate::oauth::{RefreshError, TokenRefresher};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome of a credential resolution.
#[derive(Debug)]
pub enum Resolution {
    /// A usable, non-expired credential
    Resolved(ResolvedCredential),
    /// No scope has a record for this user: prompt them to connect
    NotConfigured,
    /// At least one scope exists but could not be used right now
    TransientFailure(ResolveFailure),
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    /// Collapses the outcome to the credential, if any.
    pub fn credential(self) -> Option<ResolvedCredential> {
        match self {
            Resolution::Resolved(credential) => Some(credential),
            _ => None,
        }
    }
}

/// Why a scope that exists could not produce a credential.
#[derive(Debug, Error)]
pub enum ResolveFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stored secret failed to decrypt (tampered, wrong key, or malformed)
    #[error("Stored secret is unusable: {0}")]
    Secret(#[from] CodecError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    /// A concurrent writer rotated the tokens and the record is still expired
    #[error("Concurrent refresh conflict for {0}")]
    Conflict(String),
}

/// Public entry point agents use to obtain access tokens.
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
    codec: SecretCodec,
    refresher: TokenRefresher,
    policy: ExpiryPolicy,
    compare_and_swap: bool,
    locks: RefreshLocks,
}

impl CredentialResolver {
    /// Creates a resolver with a zero expiry margin and compare-and-swap commits.
    pub fn new(store: Arc<dyn SecretStore>, codec: SecretCodec, refresher: TokenRefresher) -> Self {
        Self {
            store,
            codec,
            refresher,
            policy: ExpiryPolicy::default(),
            compare_and_swap: true,
            locks: RefreshLocks::new(),
        }
    }

    pub fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// With compare-and-swap disabled, refreshed tokens are written
    /// last-writer-wins through `update_record`.
    pub fn with_compare_and_swap(mut self, enabled: bool) -> Self {
        self.compare_and_swap = enabled;
        self
    }

    /// Builds the store, refresher and policy described by `config`.
    ///
    /// Errors here are configuration errors and should stop the process.
    pub fn from_config(config: &VaultConfig, codec: SecretCodec) -> Result<Self, ConfigError> {
        config.validate()?;

        let store: Arc<dyn SecretStore> = match &config.store {
            StoreConfig::Sqlite { path } => Arc::new(SqliteSecretStore::new(path)?),
            StoreConfig::Rest(rest) => Arc::new(RestSecretStore::new(rest)?),
        };

        let refresher = TokenRefresher::new(config.oauth.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self::new(store, codec, refresher)
            .with_expiry_policy(ExpiryPolicy::from(&config.expiry))
            .with_compare_and_swap(config.refresh.compare_and_swap))
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    /// Resolves a usable access token for `user_id`.
    ///
    /// The global scope always wins when it yields a credential. The
    /// agent-specific scope is only consulted when `agent_id` is given and
    /// the global scope is missing, expired and unrefreshable, or unreadable.
    /// An empty `agent_id` is treated as absent.
    pub async fn resolve(&self, user_id: &str, agent_id: Option<&str>) -> Resolution {
        let mut scopes = vec![Scope::Global];
        if let Some(agent_id) = agent_id.filter(|a| !a.is_empty()) {
            scopes.push(Scope::Agent(agent_id.to_string()));
        }

        let mut first_failure = None;

        for scope in scopes {
            let key = ScopeKey::new(user_id, scope);
            match self.resolve_scope(&key).await {
                Ok(Some(credential)) => {
                    debug!(user_id = %user_id, scope = %key.scope, "Credential resolved");
                    return Resolution::Resolved(credential);
                }
                Ok(None) => {
                    debug!(user_id = %user_id, scope = %key.scope, "No credentials configured");
                }
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        scope = %key.scope,
                        error = %e,
                        "Credential scope unusable, falling through"
                    );
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(failure) => Resolution::TransientFailure(failure),
            None => Resolution::NotConfigured,
        }
    }

    /// [`CredentialResolver::resolve`] collapsed to an `Option`.
    pub async fn resolve_token(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
    ) -> Option<ResolvedCredential> {
        self.resolve(user_id, agent_id).await.credential()
    }

    async fn resolve_scope(&self, key: &ScopeKey) -> Result<Option<ResolvedCredential>, ResolveFailure> {
        let Some(record) = self.store.get_record(key).await? else {
            return Ok(None);
        };

        if !self.policy.is_expired(record.expires_at, Utc::now()) {
            return self.unseal(key, &record).map(Some);
        }

        info!(
            user_id = %key.user_id,
            scope = %key.scope,
            expires_at = %record.expires_at,
            "Access token expired, refreshing"
        );
        self.refresh_scope(key).await
    }

    async fn refresh_scope(&self, key: &ScopeKey) -> Result<Option<ResolvedCredential>, ResolveFailure> {
        let _guard = self.locks.acquire(key).await;

        // Another task may have refreshed while we waited for the lock
        let Some(record) = self.store.get_record(key).await? else {
            return Ok(None);
        };
        if !self.policy.is_expired(record.expires_at, Utc::now()) {
            debug!(user_id = %key.user_id, scope = %key.scope, "Token already refreshed");
            return self.unseal(key, &record).map(Some);
        }

        let refresh_token = self.codec.decrypt(&record.refresh_token)?;
        let response = self
            .refresher
            .refresh(&refresh_token, &record.provider_endpoint)
            .await?;

        // Providers may omit a new refresh token; keep the old one
        let next_refresh_token = response.refresh_token.as_deref().unwrap_or(&refresh_token);
        let update = RecordUpdate {
            access_token: Some(self.codec.encrypt(&response.access_token)?),
            refresh_token: Some(self.codec.encrypt(next_refresh_token)?),
            expires_at: Some(expires_from(Utc::now(), response.lifetime_seconds())),
            token_type: response.token_type.clone(),
        };

        if self.compare_and_swap {
            let committed = self
                .store
                .compare_and_update(key, &record.refresh_token, &update)
                .await?;
            if !committed {
                return self.after_lost_commit(key).await;
            }
        } else {
            self.store.update_record(key, &update).await?;
        }

        info!(
            user_id = %key.user_id,
            scope = %key.scope,
            rotated = response.refresh_token.is_some(),
            "Refreshed credentials committed"
        );

        Ok(Some(ResolvedCredential {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or(record.token_type),
            provider_endpoint: record.provider_endpoint,
            scope: key.scope.clone(),
        }))
    }

    /// Another writer changed the refresh token between read and commit.
    /// Use its result if it left a fresh token behind.
    async fn after_lost_commit(&self, key: &ScopeKey) -> Result<Option<ResolvedCredential>, ResolveFailure> {
        warn!(
            user_id = %key.user_id,
            scope = %key.scope,
            "Refresh commit lost to a concurrent writer"
        );

        match self.store.get_record(key).await? {
            Some(current) if !self.policy.is_expired(current.expires_at, Utc::now()) => {
                self.unseal(key, &current).map(Some)
            }
            Some(_) => Err(ResolveFailure::Conflict(key.to_string())),
            None => Ok(None),
        }
    }

    fn unseal(&self, key: &ScopeKey, record: &CredentialRecord) -> Result<ResolvedCredential, ResolveFailure> {
        Ok(ResolvedCredential {
            access_token: self.codec.decrypt(&record.access_token)?,
            token_type: record.token_type.clone(),
            provider_endpoint: record.provider_endpoint.clone(),
            scope: key.scope.clone(),
        })
    }
}

fn expires_from(now: DateTime<Utc>, lifetime_seconds: i64) -> DateTime<Utc> {
    now + Duration::seconds(lifetime_seconds.clamp(0, MAX_LIFETIME_SECONDS))
}
