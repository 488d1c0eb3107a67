//! Service wiring for the operator commands.

use secrecy::SecretString;
use std::sync::Arc;
use tessera_billing::{Reconciler, WebhookVerifier};
use tessera_license::{
    ConfigError, KeyProvider, LeaseService, LicenseError, ProvisioningService, RateLimiter,
    ServerKey, TierMapper,
};
use tessera_store::{Repositories, SqliteStore, StoreError};
use thiserror::Error;

use crate::config::AppConfig;

/// Startup errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot load signing key: {0}")]
    Key(#[from] LicenseError),

    #[error("cannot open database: {0}")]
    Store(#[from] StoreError),
}

/// Every service, built once from a validated configuration.
pub struct App {
    pub store: Arc<SqliteStore>,
    pub repos: Repositories,
    pub tiers: TierMapper,
    pub leases: LeaseService,
    pub provisioning: ProvisioningService,
    pub reconciler: Reconciler,
    config: AppConfig,
}

impl App {
    /// Opens the database and loads the signing key.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;
        let key_path = config
            .keys
            .signing_key
            .as_deref()
            .ok_or(ConfigError::Missing("keys.signing_key"))?;
        let key = ServerKey::load(key_path)?;
        tracing::info!(key_id = %key.key_id(), "loaded signing key");

        let store = Arc::new(SqliteStore::open(&config.database.path)?);
        tracing::info!(path = %config.database.path.display(), "opened database");

        Ok(Self::with_store(config, store, Arc::new(key))?)
    }

    /// Builds the services over an already opened store.
    pub fn with_store(
        config: AppConfig,
        store: Arc<SqliteStore>,
        keys: Arc<dyn KeyProvider>,
    ) -> Result<Self, ConfigError> {
        let tiers = config.tiers.build()?;
        let repos = Repositories::from_store(Arc::clone(&store));
        let leases = LeaseService::new(keys, config.lease.clone());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let provisioning =
            ProvisioningService::new(repos.clone(), leases.clone(), config.offline.clone())
                .with_rate_limiter(limiter);
        let reconciler = Reconciler::new(repos.clone(), tiers.clone());

        Ok(Self {
            store,
            repos,
            tiers,
            leases,
            provisioning,
            reconciler,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Webhook verifier; fails if no secret is configured.
    pub fn webhook_verifier(&self) -> Result<WebhookVerifier, ConfigError> {
        let secret = self.config.webhook_secret()?;
        Ok(WebhookVerifier::new(SecretString::from(secret.to_owned()))
            .with_tolerance(self.config.webhook.tolerance_secs))
    }

    /// Rewrites legacy `"founders"` tier rows with the recomputed tier.
    pub fn repair_legacy_founders(&self) -> Result<usize, StoreError> {
        self.store
            .repair_legacy_founders(|tier, metadata| self.tiers.repair_founders_tier(tier, metadata))
    }
}
