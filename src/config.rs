use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub reconcile: ReconcileConfig,
    pub query: QueryConfig,
    pub digest: DigestConfig,
    pub database: DatabaseConfig,
}

/// Case-management provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Report id of the process extract
    pub report_id: i64,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Inline API key, mostly for tests; the env variable wins when set
    pub api_key: Option<String>,
    /// A token expiring within this many seconds is treated as expired
    pub token_grace_secs: i64,
    /// TTL assumed when the token exchange does not report one
    pub default_token_ttl_secs: i64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cloudapp.redelex.com/api".to_string(),
            report_id: 0,
            api_key_env: "PROVIDER_API_KEY".to_string(),
            api_key: None,
            token_grace_secs: 60,
            default_token_ttl_secs: 86_400,
        }
    }
}

impl ProviderConfig {
    /// API key from the environment, falling back to the inline value
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .or_else(|| self.api_key.clone())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

/// Reconciliation job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub batch_size: usize,
    /// Lease duration; a crashed run frees the lease after this long
    pub lease_ttl_secs: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            lease_ttl_secs: 3600,
        }
    }
}

/// Query layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Report denied detail lookups as not found
    pub conceal_forbidden: bool,
    /// Normalized identifiers shorter than this only match exactly. Zero lets
    /// any identifier match by containment.
    pub min_fuzzy_match_digits: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            conceal_forbidden: false,
            min_fuzzy_match_digits: 0,
        }
    }
}

/// Daily digest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Offset used to decide what "yesterday" means
    pub utc_offset_hours: i32,
    pub retention_days: i64,
    pub mailer: MailerConfig,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: -5,
            retention_days: 30,
            mailer: MailerConfig::default(),
        }
    }
}

/// Outbound mail relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailerConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub sender: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            sender: "notificaciones@example.com".to_string(),
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "DATABASE_URL".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_url(&self) -> Result<String> {
        std::env::var(&self.url_env).with_context(|| format!("{} not set", self.url_env))
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!(path = %path.display(), "Loaded configuration");

        Ok(config)
    }

    /// Load configuration from the default location (.case-sync/config.yml)
    pub fn load_default() -> Result<Self> {
        Self::load(".case-sync/config.yml")
    }
}
