//! `tessera.toml` loading and startup validation.
//!
//! ```toml
//! [database]
//! path = "/var/lib/tessera/tessera.db"
//!
//! [keys]
//! signing_key = "/etc/tessera/signing.pem"
//!
//! [tiers]
//! founders_start = "2024-01-01T00:00:00Z"
//! founders_end = "2024-03-31T23:59:59Z"
//!
//! [webhook]
//! tolerance_secs = 300
//! ```
//!
//! Every section has defaults except the founders window and the signing
//! key. `TESSERA_DATABASE_PATH` and `TESSERA_WEBHOOK_SECRET` override the
//! file.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tessera_billing::DEFAULT_TOLERANCE_SECS;
use tessera_license::{
    ConfigError, LeaseConfig, MAX_DURATION_SECS, OfflineConfig, RateLimitConfig, TierConfig,
};
use thiserror::Error;

pub const ENV_DATABASE_PATH: &str = "TESSERA_DATABASE_PATH";
pub const ENV_WEBHOOK_SECRET: &str = "TESSERA_WEBHOOK_SECRET";

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeysConfig {
    /// Server signing key: PKCS#8 PEM or DER, or a raw 32-byte seed.
    pub signing_key: Option<PathBuf>,
}

/// Webhook settings. The secret is normally supplied through the
/// environment rather than the file.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub keys: KeysConfig,
    pub lease: LeaseConfig,
    pub tiers: TierConfig,
    pub webhook: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub offline: OfflineConfig,
}

impl AppConfig {
    /// Reads, parses and validates a configuration file, then applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, AppConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AppConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, AppConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies overrides from `lookup`, normally the process environment.
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|v| !v.trim().is_empty()) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secret) = lookup(ENV_WEBHOOK_SECRET).filter(|v| !v.trim().is_empty()) {
            self.webhook.secret = Some(secret);
        }
    }

    /// Checks every section. Any failure here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keys.signing_key.is_none() {
            return Err(ConfigError::Missing("keys.signing_key"));
        }
        self.lease.validate()?;
        self.offline.validate()?;
        self.rate_limit.validate()?;
        self.tiers.build()?;
        if self.webhook.tolerance_secs <= 0 {
            return Err(ConfigError::NonPositive("webhook.tolerance_secs"));
        }
        if self.webhook.tolerance_secs > MAX_DURATION_SECS {
            return Err(ConfigError::TooLarge {
                name: "webhook.tolerance_secs",
                max: MAX_DURATION_SECS,
            });
        }
        Ok(())
    }

    /// The webhook secret, required only by commands that verify deliveries.
    pub fn webhook_secret(&self) -> Result<&str, ConfigError> {
        self.webhook
            .secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("webhook.secret"))
    }
}
