//! Tier determination.
//!
//! Maps purchase attributes to a feature tier and, independently, decides
//! whether the purchase is a lifetime grant. Lookups run in priority order:
//!
//! 1. exact price identifier (confidence high)
//! 2. rounded whole-dollar amount (confidence medium)
//! 3. fallback to `pro` (confidence low, flagged for review)
//!
//! Lifetime is a billing property: it is true iff the purchase was created
//! inside the founders window, whatever the tier.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_types::{Confidence, EntitlementMetadata, FoundersRepair, Tier};

use crate::config::ConfigError;

/// Stored tier value written by legacy records.
pub const LEGACY_FOUNDERS_TIER: &str = "founders";

/// Inclusive date window in which purchases become lifetime grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundersWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl FoundersWindow {
    /// Creates a window. An open-ended window is a configuration error.
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<Self, ConfigError> {
        let end = end.ok_or(ConfigError::UnboundedFoundersWindow)?;
        if end < start {
            return Err(ConfigError::InvertedFoundersWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Returns true if `at` falls inside the window, both ends included.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// What the mapper looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAttrs {
    pub price_id: Option<String>,
    /// Amount in major currency units.
    pub amount: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Result of a tier determination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierDecision {
    pub tier: Tier,
    pub is_lifetime: bool,
    pub max_devices: u32,
    pub confidence: Confidence,
    pub reason: String,
}

impl TierDecision {
    /// Low-confidence decisions must be surfaced for manual review.
    #[must_use]
    pub fn needs_review(&self) -> bool {
        self.confidence.needs_review()
    }
}

/// Pure purchase-to-tier mapping.
#[derive(Debug, Clone)]
pub struct TierMapper {
    prices: BTreeMap<String, Tier>,
    amounts: BTreeMap<i64, Tier>,
    founders: FoundersWindow,
    fallback: Tier,
    payment_term: Duration,
}

impl TierMapper {
    /// Creates a mapper from price and whole-dollar amount tables.
    #[must_use]
    pub fn new(
        prices: BTreeMap<String, Tier>,
        amounts: BTreeMap<i64, Tier>,
        founders: FoundersWindow,
    ) -> Self {
        Self {
            prices,
            amounts,
            founders,
            fallback: Tier::Pro,
            payment_term: Duration::days(365),
        }
    }

    /// Sets how long a non-lifetime one-time purchase lasts.
    #[must_use]
    pub fn with_payment_term(mut self, term: Duration) -> Self {
        self.payment_term = term;
        self
    }

    #[must_use]
    pub fn founders_window(&self) -> &FoundersWindow {
        &self.founders
    }

    #[must_use]
    pub fn payment_term(&self) -> Duration {
        self.payment_term
    }

    #[must_use]
    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        self.prices.get(price_id.trim()).copied()
    }

    /// Looks up a tier by amount rounded to whole dollars.
    #[must_use]
    pub fn tier_for_amount(&self, amount: f64) -> Option<Tier> {
        if !amount.is_finite() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let dollars = amount.round() as i64;
        self.amounts.get(&dollars).copied()
    }

    /// Determines tier and lifetime for a purchase.
    #[must_use]
    pub fn determine(&self, attrs: &PurchaseAttrs) -> TierDecision {
        let is_lifetime = self.founders.contains(attrs.created_at);
        let (tier, confidence, reason) = self.classify(attrs.price_id.as_deref(), attrs.amount);

        if confidence.needs_review() {
            tracing::warn!(
                price_id = attrs.price_id.as_deref().unwrap_or("-"),
                amount = attrs.amount,
                tier = %tier,
                "tier determined by fallback; flagged for review"
            );
        }

        TierDecision {
            tier,
            is_lifetime,
            max_devices: tier.max_devices(),
            confidence,
            reason,
        }
    }

    fn classify(&self, price_id: Option<&str>, amount: Option<f64>) -> (Tier, Confidence, String) {
        if let Some(price_id) = price_id {
            if let Some(tier) = self.tier_for_price(price_id) {
                return (tier, Confidence::High, format!("price {price_id}"));
            }
        }
        if let Some(amount) = amount {
            if let Some(tier) = self.tier_for_amount(amount) {
                return (tier, Confidence::Medium, format!("amount {amount:.2}"));
            }
        }
        (
            self.fallback,
            Confidence::Low,
            "no price or amount match; fallback tier".to_string(),
        )
    }

    /// Repairs a legacy record that stored "founders" as its tier.
    ///
    /// Returns `None` for any other stored value. The tier is recomputed
    /// from the original price id and amount, defaulting to `pro`; the
    /// caller must force `is_lifetime = true` and clear the expiry.
    #[must_use]
    pub fn repair_founders_tier(
        &self,
        stored_tier: &str,
        metadata: &EntitlementMetadata,
    ) -> Option<FoundersRepair> {
        if !stored_tier.trim().eq_ignore_ascii_case(LEGACY_FOUNDERS_TIER) {
            return None;
        }
        let (tier, confidence, _) = self.classify(
            metadata.original_price_id.as_deref(),
            metadata.original_amount,
        );
        tracing::info!(tier = %tier, confidence = %confidence, "recomputed legacy founders tier");
        Some(FoundersRepair { tier })
    }
}
