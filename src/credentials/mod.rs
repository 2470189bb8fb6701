//! Encrypted credential records for OAuth tokens.
//!
//! Records are keyed by `(user_id, scope)` where the scope is either the
//! user's global credential (shared across agents) or a per-agent override.
//! Tokens are sealed with [`SecretCodec`] before they reach a store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecretStore (trait)                │
//! │  - point lookups by (user, scope)        │
//! │  - partial updates / compare-and-swap    │
//! └─────────────────────────────────────────┘
//!        ↓                      ↓
//! ┌──────────────────┐  ┌──────────────────┐
//! │ SqliteSecretStore│  │ RestSecretStore  │
//! │  (local file)    │  │  (PostgREST API) │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Security
//!
//! - Stores only ever see [`EncryptedSecret`] values
//! - Each token has a unique IV (never reused)
//! - The master key lives in the codec only, injected at startup

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod encryption;
pub mod expiry;
pub mod rest;
pub mod storage;

pub use encryption::{CodecError, SecretCodec, KEY_SIZE};
pub use expiry::{parse_expires_at, ExpiryPolicy};
pub use rest::{RestSecretStore, RestStoreConfig};
pub use storage::SqliteSecretStore;

/// Token type used when a record or provider does not name one.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Sealed secret in `hex(iv):hex(tag):hex(ciphertext)` form.
///
/// Only [`SecretCodec`] produces or opens these. Stores treat the value as
/// an opaque string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    /// Wraps a value read back from a store.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedSecret({} chars)", self.0.len())
    }
}

/// Granularity at which a credential is stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One record per user, shared by every agent
    Global,
    /// One record per (user, agent) pair
    Agent(String),
}

impl Scope {
    const GLOBAL: &'static str = "global";
    const AGENT_PREFIX: &'static str = "agent:";

    /// Persisted form: `global` or `agent:<agent_id>`.
    pub fn as_key(&self) -> String {
        match self {
            Scope::Global => Self::GLOBAL.to_string(),
            Scope::Agent(agent_id) => format!("{}{}", Self::AGENT_PREFIX, agent_id),
        }
    }

    /// Parses the persisted form back into a scope.
    pub fn from_key(key: &str) -> Option<Self> {
        if key == Self::GLOBAL {
            return Some(Scope::Global);
        }
        key.strip_prefix(Self::AGENT_PREFIX)
            .filter(|agent_id| !agent_id.is_empty())
            .map(|agent_id| Scope::Agent(agent_id.to_string()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Store key for one credential record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub user_id: String,
    pub scope: Scope,
}

impl ScopeKey {
    pub fn new(user_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            user_id: user_id.into(),
            scope,
        }
    }

    pub fn global(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Scope::Global)
    }

    pub fn agent(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(user_id, Scope::Agent(agent_id.into()))
    }

    /// Rejects empty user or agent identifiers before they reach a store.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.user_id.is_empty() {
            return Err(StoreError::InvalidKey("user_id is empty".to_string()));
        }
        if let Scope::Agent(agent_id) = &self.scope {
            if agent_id.is_empty() {
                return Err(StoreError::InvalidKey("agent_id is empty".to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.scope)
    }
}

/// Persisted OAuth credential for one (user, scope).
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    /// Short-lived token presented to the resource server
    pub access_token: EncryptedSecret,

    /// Long-lived token, sent only to the token endpoint
    pub refresh_token: EncryptedSecret,

    /// When the access token expires (UTC)
    pub expires_at: DateTime<Utc>,

    /// Usually "Bearer"
    pub token_type: String,

    /// Resource server URL; the token endpoint is discovered from it
    pub provider_endpoint: String,
}

/// Partial update of a [`CredentialRecord`]. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordUpdate {
    pub access_token: Option<EncryptedSecret>,
    pub refresh_token: Option<EncryptedSecret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
}

impl RecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.expires_at.is_none()
            && self.token_type.is_none()
    }
}

/// Decrypted credential handed to an agent for one outbound call.
///
/// Never persisted or cached; every resolution decrypts again.
#[derive(Clone, PartialEq)]
pub struct ResolvedCredential {
    pub access_token: String,
    pub token_type: String,
    pub provider_endpoint: String,
    /// Scope the credential was resolved from
    pub scope: Scope,
}

impl ResolvedCredential {
    /// Value for an HTTP `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("provider_endpoint", &self.provider_endpoint)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Secret store failures. "No record" is `Ok(None)`, never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity or authorization failure talking to the store
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),

    /// Update targeted a record that does not exist
    #[error("No credential record for {0}")]
    RecordMissing(String),

    /// Row exists but cannot be interpreted
    #[error("Corrupt credential record: {0}")]
    Corrupt(String),

    #[error("Invalid credential key: {0}")]
    InvalidKey(String),
}

/// Key-value access to credential records.
///
/// Implementations must keep "not found" (`Ok(None)`) distinct from
/// [`StoreError::Unavailable`] so callers can tell "never connected" from
/// "store is down".
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Point lookup of one record.
    async fn get_record(&self, key: &ScopeKey) -> Result<Option<CredentialRecord>, StoreError>;

    /// Writes the named fields of `update`, leaving the rest untouched.
    async fn update_record(&self, key: &ScopeKey, update: &RecordUpdate) -> Result<(), StoreError>;

    /// Like [`SecretStore::update_record`], but only commits while the stored
    /// refresh token still equals `expected_refresh_token`.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_update(
        &self,
        key: &ScopeKey,
        expected_refresh_token: &EncryptedSecret,
        update: &RecordUpdate,
    ) -> Result<bool, StoreError>;

    /// Inserts or replaces a whole record (account connection).
    async fn put_record(&self, key: &ScopeKey, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Removes a record (account disconnection). Returns whether one existed.
    async fn delete_record(&self, key: &ScopeKey) -> Result<bool, StoreError>;

    /// Scopes with stored credentials for a user.
    async fn list_scopes(&self, user_id: &str) -> Result<Vec<Scope>, StoreError>;
}
