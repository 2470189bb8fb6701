use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tokenvault::config::{codec_from_env, load_config, VaultConfig};
use tokenvault::credentials::{CredentialRecord, ScopeKey, DEFAULT_TOKEN_TYPE, KEY_SIZE};
use tokenvault::{CredentialResolver, Resolution};
use tracing::info;

/// Operator tool for agent OAuth credentials
#[derive(Parser, Debug)]
#[command(name = "tokenvault", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "TOKENVAULT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a usable access token (global scope first, then the agent's)
    Resolve {
        #[arg(long)]
        user: String,
        #[arg(long)]
        agent: Option<String>,
        /// Print the access token itself
        #[arg(long)]
        show_token: bool,
    },

    /// Store tokens obtained from a completed consent flow
    Connect {
        #[arg(long)]
        user: String,
        /// Store as an agent-specific credential instead of the global one
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, env = "TOKENVAULT_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
        #[arg(long, env = "TOKENVAULT_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,
        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600, value_parser = clap::value_parser!(i64).range(1..=31_536_000))]
        expires_in: i64,
        #[arg(long, default_value = DEFAULT_TOKEN_TYPE)]
        token_type: String,
        /// Resource server URL
        #[arg(long)]
        endpoint: String,
    },

    /// Remove a stored credential
    Disconnect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        agent: Option<String>,
    },

    /// List the scopes a user has credentials for
    Scopes {
        #[arg(long)]
        user: String,
    },

    /// Print a fresh random encryption key (hex)
    GenerateKey,
}

fn scope_key(user: String, agent: Option<String>) -> ScopeKey {
    match agent {
        Some(agent) => ScopeKey::agent(user, agent),
        None => ScopeKey::global(user),
    }
}

/// Loads configuration (file, then `TOKENVAULT_*` overrides) and the
/// encryption key, and builds the resolver.
fn build_resolver(config_path: Option<&str>) -> Result<CredentialResolver> {
    let mut config = match config_path {
        Some(path) => load_config(path).with_context(|| format!("Failed to load {}", path))?,
        None => VaultConfig::default(),
    };
    config.apply_env();

    let codec = codec_from_env().context("Encryption key is not usable")?;
    let resolver =
        CredentialResolver::from_config(&config, codec).context("Failed to initialize resolver")?;

    info!(
        expiry_margin_seconds = config.expiry.margin_seconds,
        compare_and_swap = config.refresh.compare_and_swap,
        "Configuration loaded"
    );

    Ok(resolver)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenvault=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Resolve {
            user,
            agent,
            show_token,
        } => match build_resolver(config_path)?
            .resolve(&user, agent.as_deref())
            .await
        {
            Resolution::Resolved(credential) => {
                println!("scope: {}", credential.scope);
                println!("token_type: {}", credential.token_type);
                println!("provider_endpoint: {}", credential.provider_endpoint);
                if show_token {
                    println!("access_token: {}", credential.access_token);
                }
            }
            Resolution::NotConfigured => {
                anyhow::bail!("No credentials configured for {}; connect an account first", user)
            }
            Resolution::TransientFailure(failure) => {
                return Err(anyhow::Error::new(failure)
                    .context(format!("Credentials for {} are currently unavailable", user)));
            }
        },

        Command::Connect {
            user,
            agent,
            access_token,
            refresh_token,
            expires_in,
            token_type,
            endpoint,
        } => {
            let resolver = build_resolver(config_path)?;
            let key = scope_key(user, agent);
            let codec = resolver.codec();
            let record = CredentialRecord {
                access_token: codec.encrypt(&access_token)?,
                refresh_token: codec.encrypt(&refresh_token)?,
                expires_at: Utc::now() + Duration::seconds(expires_in),
                token_type,
                provider_endpoint: endpoint,
            };
            resolver
                .store()
                .put_record(&key, &record)
                .await
                .context("Failed to store credentials")?;
            info!(key = %key, "Credentials stored");
        }

        Command::Disconnect { user, agent } => {
            let key = scope_key(user, agent);
            let removed = build_resolver(config_path)?
                .store()
                .delete_record(&key)
                .await
                .context("Failed to delete credentials")?;
            if removed {
                info!(key = %key, "Credentials removed");
            } else {
                println!("No credentials stored for {}", key);
            }
        }

        Command::Scopes { user } => {
            let scopes = build_resolver(config_path)?
                .store()
                .list_scopes(&user)
                .await
                .context("Failed to list scopes")?;
            for scope in scopes {
                println!("{}", scope);
            }
        }

        Command::GenerateKey => {
            let mut key = [0u8; KEY_SIZE];
            rand::thread_rng().fill_bytes(&mut key);
            println!("{}", hex::encode(key));
        }
    }

    Ok(())
}
