// Configuration (TOML file + environment overrides)
pub mod config;

// Encrypted credential records and secret stores
pub mod credentials;

// OAuth discovery and refresh-token grant
pub mod oauth;

// Scope-ordered credential resolution for agents
pub mod resolver;

pub use credentials::{ResolvedCredential, Scope, ScopeKey, SecretCodec, SecretStore};
pub use resolver::{CredentialResolver, Resolution, ResolveFailure};
