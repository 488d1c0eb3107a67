//! Configuration sections owned by the licensing crate.
//!
//! Every section deserializes with defaults, but [`TierConfig::build`] and
//! the `validate` methods must be called at startup: a bad configuration is
//! fatal there, never at request time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tessera_types::Tier;

use crate::tier::{FoundersWindow, TierMapper};

/// Longest duration any setting may configure, in seconds (ten years).
pub const MAX_DURATION_SECS: i64 = 10 * 366 * 24 * 60 * 60;

const MAX_DURATION_DAYS: i64 = MAX_DURATION_SECS / (24 * 60 * 60);

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The founders window has no end date.
    #[error("founders window must have a concrete end date")]
    UnboundedFoundersWindow,

    /// The founders window ends before it starts.
    #[error("founders window ends ({end}) before it starts ({start})")]
    InvertedFoundersWindow { start: String, end: String },

    /// A tier table names an unknown tier.
    #[error("unknown tier {value:?} in [{table}]")]
    UnknownTier { table: &'static str, value: String },

    /// An amount table key is not a whole number.
    #[error("invalid amount {0:?} in tier amount table")]
    InvalidAmount(String),

    /// A duration setting is zero or negative.
    #[error("{0} must be positive")]
    NonPositive(&'static str),

    /// A duration setting exceeds the supported maximum.
    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: i64 },

    /// A required setting is missing.
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

/// Token lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease token lifetime in seconds (default 7 days).
    pub lease_ttl_secs: i64,
    /// Challenge token lifetime in seconds (default 10 minutes).
    pub challenge_ttl_secs: i64,
    /// Activation token lifetime in seconds (default 72 hours).
    pub activation_ttl_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 7 * 24 * 60 * 60,
            challenge_ttl_secs: 10 * 60,
            activation_ttl_secs: 72 * 60 * 60,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("lease.lease_ttl_secs", self.lease_ttl_secs)?;
        positive("lease.challenge_ttl_secs", self.challenge_ttl_secs)?;
        positive("lease.activation_ttl_secs", self.activation_ttl_secs)?;
        at_most("lease.lease_ttl_secs", self.lease_ttl_secs, MAX_DURATION_SECS)?;
        at_most("lease.challenge_ttl_secs", self.challenge_ttl_secs, MAX_DURATION_SECS)?;
        at_most("lease.activation_ttl_secs", self.activation_ttl_secs, MAX_DURATION_SECS)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.lease_ttl_secs)
    }

    #[must_use]
    pub fn challenge_ttl(&self) -> Duration {
        Duration::seconds(self.challenge_ttl_secs)
    }

    #[must_use]
    pub fn activation_ttl(&self) -> Duration {
        Duration::seconds(self.activation_ttl_secs)
    }
}

/// Freshness bounds for device-signed offline requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OfflineConfig {
    /// Oldest accepted request `iat`, in seconds before now (default 30 days).
    pub request_max_age_secs: i64,
    /// Tolerated clock skew for `iat` in the future (default 5 minutes).
    pub future_skew_secs: i64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            request_max_age_secs: 30 * 24 * 60 * 60,
            future_skew_secs: 5 * 60,
        }
    }
}

impl OfflineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("offline.request_max_age_secs", self.request_max_age_secs)?;
        if self.future_skew_secs < 0 {
            return Err(ConfigError::NonPositive("offline.future_skew_secs"));
        }
        at_most("offline.request_max_age_secs", self.request_max_age_secs, MAX_DURATION_SECS)?;
        at_most("offline.future_skew_secs", self.future_skew_secs, MAX_DURATION_SECS)
    }
}

/// Per-customer sliding-window limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per customer within the window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Run a cleanup pass every N checks.
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
            cleanup_interval: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::NonPositive("rate_limit.max_requests"));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::NonPositive("rate_limit.window_secs"));
        }
        if self.cleanup_interval == 0 {
            return Err(ConfigError::NonPositive("rate_limit.cleanup_interval"));
        }
        Ok(())
    }
}

/// Tier tables and the founders window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierConfig {
    /// First instant of the founders window.
    pub founders_start: Option<DateTime<Utc>>,
    /// Last instant of the founders window (inclusive). Required.
    pub founders_end: Option<DateTime<Utc>>,
    /// Price identifier to tier name.
    pub prices: BTreeMap<String, String>,
    /// Whole-dollar amount to tier name.
    pub amounts: BTreeMap<String, String>,
    /// Days until a one-time purchase outside the founders window expires.
    pub payment_term_days: i64,
}

impl Default for TierConfig {
    fn default() -> Self {
        let prices = Tier::ALL
            .iter()
            .map(|t| (format!("price_{t}"), t.to_string()))
            .collect();
        let amounts = [
            ("99", Tier::Maker),
            ("199", Tier::Pro),
            ("49", Tier::Education),
            ("499", Tier::Enterprise),
        ]
        .into_iter()
        .map(|(amount, tier)| (amount.to_string(), tier.to_string()))
        .collect();
        Self {
            founders_start: None,
            founders_end: None,
            prices,
            amounts,
            payment_term_days: 365,
        }
    }
}

impl TierConfig {
    /// Validates the section and builds the mapper.
    ///
    /// # Errors
    ///
    /// Fails if the founders window is unbounded or inverted, a table names
    /// an unknown tier, or an amount key is not an integer.
    pub fn build(&self) -> Result<TierMapper, ConfigError> {
        let start = self.founders_start.ok_or(ConfigError::Missing("tiers.founders_start"))?;
        let window = FoundersWindow::new(start, self.founders_end)?;
        positive("tiers.payment_term_days", self.payment_term_days)?;
        at_most("tiers.payment_term_days", self.payment_term_days, MAX_DURATION_DAYS)?;

        let mut prices = BTreeMap::new();
        for (price_id, tier) in &self.prices {
            prices.insert(price_id.clone(), parse_tier("tiers.prices", tier)?);
        }

        let mut amounts = BTreeMap::new();
        for (amount, tier) in &self.amounts {
            let dollars: i64 = amount
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAmount(amount.clone()))?;
            amounts.insert(dollars, parse_tier("tiers.amounts", tier)?);
        }

        Ok(TierMapper::new(prices, amounts, window)
            .with_payment_term(Duration::days(self.payment_term_days)))
    }
}

fn parse_tier(table: &'static str, value: &str) -> Result<Tier, ConfigError> {
    value.parse().map_err(|_| ConfigError::UnknownTier {
        table,
        value: value.to_string(),
    })
}

fn positive(name: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NonPositive(name));
    }
    Ok(())
}

fn at_most(name: &'static str, value: i64, max: i64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { name, max });
    }
    Ok(())
}
