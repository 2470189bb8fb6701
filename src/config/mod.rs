use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

// Re-export component config types
pub use crate::credentials::expiry::ExpiryConfig;
pub use crate::credentials::RestStoreConfig;
pub use crate::oauth::OAuthConfig;

use crate::credentials::expiry::MAX_LIFETIME_SECONDS;
use crate::credentials::rest::{default_request_timeout, default_table};
use crate::credentials::{CodecError, SecretCodec, StoreError};

/// Environment variable holding the 64-hex-character encryption key
pub const ENCRYPTION_KEY_ENV: &str = "TOKENVAULT_ENCRYPTION_KEY";

/// Complete tokenvault configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VaultConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Secret store backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Local SQLite file
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
    /// PostgREST-style HTTP service
    Rest(RestStoreConfig),
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("credentials.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

/// Refresh commit configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Commit refreshed tokens only if the stored refresh token is unchanged
    #[serde(default = "default_compare_and_swap")]
    pub compare_and_swap: bool,
}

fn default_compare_and_swap() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            compare_and_swap: default_compare_and_swap(),
        }
    }
}

/// Startup configuration errors. These are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} is not set", ENCRYPTION_KEY_ENV)]
    MissingEncryptionKey,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to open secret store: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl VaultConfig {
    /// Applies `TOKENVAULT_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TOKENVAULT_STORE_URL") {
            let service_key = lookup("TOKENVAULT_STORE_SERVICE_KEY");
            self.store = match std::mem::take(&mut self.store) {
                StoreConfig::Rest(mut rest) => {
                    rest.url = url;
                    rest.service_key = service_key.or(rest.service_key);
                    StoreConfig::Rest(rest)
                }
                StoreConfig::Sqlite { .. } => StoreConfig::Rest(RestStoreConfig {
                    url,
                    service_key,
                    table: default_table(),
                    request_timeout_seconds: default_request_timeout(),
                }),
            };
        } else if let Some(path) = lookup("TOKENVAULT_STORE_PATH") {
            self.store = StoreConfig::Sqlite {
                path: PathBuf::from(path),
            };
        }

        if let Some(v) = lookup("TOKENVAULT_OAUTH_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup("TOKENVAULT_OAUTH_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.oauth.request_timeout_seconds = n;
            }
        }
        if let Some(v) = lookup("TOKENVAULT_EXPIRY_MARGIN_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.expiry.margin_seconds = n;
            }
        }
        if let Some(v) = lookup("TOKENVAULT_REFRESH_COMPARE_AND_SWAP") {
            if let Ok(b) = v.parse::<bool>() {
                self.refresh.compare_and_swap = b;
            }
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let StoreConfig::Rest(rest) = &self.store {
            if rest.url.is_empty() {
                return Err(ConfigError::Invalid("store.url is empty".to_string()));
            }
            if rest.service_key.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid(
                    "store.service_key is required for the rest backend".to_string(),
                ));
            }
        }
        if self.oauth.client_id.is_empty() {
            return Err(ConfigError::Invalid("oauth.client_id is empty".to_string()));
        }
        if self.oauth.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "oauth.request_timeout_seconds must be positive".to_string(),
            ));
        }
        if !(0..=MAX_LIFETIME_SECONDS).contains(&self.expiry.margin_seconds) {
            return Err(ConfigError::Invalid(format!(
                "expiry.margin_seconds must be between 0 and {}",
                MAX_LIFETIME_SECONDS
            )));
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<VaultConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: VaultConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Builds the secret codec from the process environment.
pub fn codec_from_env() -> Result<SecretCodec, ConfigError> {
    codec_from_value(std::env::var(ENCRYPTION_KEY_ENV).ok())
}

fn codec_from_value(value: Option<String>) -> Result<SecretCodec, ConfigError> {
    let key = value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEncryptionKey)?;
    Ok(SecretCodec::from_hex(&key)?)
}
