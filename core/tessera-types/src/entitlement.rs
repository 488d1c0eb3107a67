//! Entitlement records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Confidence, CustomerId, EntitlementId, Error, Tier};

/// Lifecycle status of an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    /// In good standing; devices may be bound and leases issued.
    Active,
    /// Payment trouble (past due / unpaid); can be reactivated by a payment.
    Inactive,
    /// Subscription ended.
    Canceled,
    /// Soft-retired after its expiry passed.
    Expired,
}

impl EntitlementStatus {
    /// Returns true if the entitlement currently grants access.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// What created an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementSource {
    /// One-time checkout.
    Purchase,
    /// Recurring subscription checkout.
    Subscription,
    /// Time-boxed trial grant.
    Trial,
    /// Created by an operator.
    Admin,
}

impl EntitlementSource {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Subscription => "subscription",
            Self::Trial => "trial",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for EntitlementSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "subscription" => Ok(Self::Subscription),
            "trial" => Ok(Self::Trial),
            "admin" => Ok(Self::Admin),
            other => Err(Error::InvalidSource(other.to_string())),
        }
    }
}

/// Bookkeeping attached to an entitlement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementMetadata {
    /// Provider creation timestamp (unix seconds) of the newest billing
    /// event applied to this entitlement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_created: Option<i64>,
    /// Price identifier of the originating purchase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price_id: Option<String>,
    /// Amount (major currency units) of the originating purchase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_amount: Option<f64>,
    /// Confidence of the tier determination at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_confidence: Option<Confidence>,
    /// Set when the tier was guessed and must be checked by a human.
    #[serde(default)]
    pub needs_review: bool,
}

/// A customer's grant of a feature tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub id: EntitlementId,
    pub customer_id: CustomerId,
    pub tier: Tier,
    pub status: EntitlementStatus,
    pub source: EntitlementSource,
    /// Never-expiring grant. Implies `expires_at == None` and is never touched
    /// by subscription lifecycle events.
    pub is_lifetime: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub max_devices: u32,
    pub stripe_subscription_id: Option<String>,
    #[serde(default)]
    pub metadata: EntitlementMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Creates an active entitlement with the tier's default device limit.
    #[must_use]
    pub fn new(
        customer_id: CustomerId,
        tier: Tier,
        source: EntitlementSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntitlementId::new(),
            customer_id,
            tier,
            status: EntitlementStatus::Active,
            source,
            is_lifetime: false,
            expires_at: None,
            current_period_end: None,
            cancel_at_period_end: false,
            max_devices: tier.max_devices(),
            stripe_subscription_id: None,
            metadata: EntitlementMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the entitlement as a lifetime grant, clearing any expiry.
    #[must_use]
    pub fn into_lifetime(mut self) -> Self {
        self.is_lifetime = true;
        self.expires_at = None;
        self
    }

    /// Returns true for time-boxed trial grants.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.source == EntitlementSource::Trial
    }

    /// Returns true if the entitlement is active and not past its expiry.
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.expires_at.is_none_or(|exp| now < exp)
    }

    /// Checks the lifetime invariant (`is_lifetime` implies no expiry).
    #[must_use]
    pub fn lifetime_invariant_holds(&self) -> bool {
        !self.is_lifetime || self.expires_at.is_none()
    }
}

/// Result of repairing a legacy record that stored "founders" as its tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundersRepair {
    /// Recomputed feature tier.
    pub tier: Tier,
}
