//! Purchases and the license keys issued for them.
//!
//! A completed checkout produces exactly one purchase, one license key and
//! one entitlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{CustomerId, EntitlementId, Error, LicenseKeyId, PurchaseId};

/// Checkout mode reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseMode {
    /// One-time payment.
    Payment,
    /// Recurring subscription.
    Subscription,
}

impl PurchaseMode {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Subscription => "subscription",
        }
    }
}

impl FromStr for PurchaseMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(Self::Payment),
            "subscription" => Ok(Self::Subscription),
            other => Err(Error::InvalidPurchaseMode(other.to_string())),
        }
    }
}

/// A completed checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: PurchaseId,
    pub customer_id: CustomerId,
    /// Provider checkout session identifier; unique per purchase.
    pub checkout_session_id: String,
    pub mode: PurchaseMode,
    pub price_id: Option<String>,
    /// Amount in major currency units.
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A human-readable license key tied to one purchase and one entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseKey {
    pub id: LicenseKeyId,
    pub purchase_id: PurchaseId,
    pub entitlement_id: EntitlementId,
    pub key: String,
    pub created_at: DateTime<Utc>,
}
