//! Billing events from the payment provider.
//!
//! Only the envelope fields `id`, `type`, `created` and `data.object` are
//! read. The object is decoded into a typed record for the event types the
//! reconciler handles; every other type is kept as [`EventKind::Unhandled`]
//! so it can still be recorded as processed.
//!
//! ```json
//! {
//!   "id": "evt_123",
//!   "type": "checkout.session.completed",
//!   "created": 1700000000,
//!   "data": { "object": { "id": "cs_123", "mode": "payment", ... } }
//! }
//! ```

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use tessera_types::{CustomerRef, PurchaseMode};

use crate::error::WebhookError;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// A verified provider event.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    /// Provider-assigned creation time (unix seconds); orders deliveries.
    pub created: i64,
    pub kind: EventKind,
}

/// Typed payload of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSession),
    SubscriptionCreated(Subscription),
    SubscriptionUpdated(Subscription),
    SubscriptionDeleted(Subscription),
    InvoicePaymentSucceeded(Invoice),
    InvoicePaymentFailed(Invoice),
    /// Any event type the reconciler does not act on.
    Unhandled(String),
}

impl EventKind {
    /// Provider event type string.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::CheckoutCompleted(_) => CHECKOUT_COMPLETED,
            Self::SubscriptionCreated(_) => SUBSCRIPTION_CREATED,
            Self::SubscriptionUpdated(_) => SUBSCRIPTION_UPDATED,
            Self::SubscriptionDeleted(_) => SUBSCRIPTION_DELETED,
            Self::InvoicePaymentSucceeded(_) => INVOICE_PAYMENT_SUCCEEDED,
            Self::InvoicePaymentFailed(_) => INVOICE_PAYMENT_FAILED,
            Self::Unhandled(event_type) => event_type,
        }
    }
}

/// `checkout.session.completed` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: PurchaseMode,
    #[serde(deserialize_with = "customer_ref")]
    pub customer: CustomerRef,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    /// Total in minor currency units.
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Session creation time (unix seconds); decides the founders window.
    pub created: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutSession {
    /// Price identifier, passed through session metadata.
    #[must_use]
    pub fn price_id(&self) -> Option<&str> {
        self.metadata.get("price_id").map(String::as_str)
    }

    /// Amount in major currency units.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn amount(&self) -> Option<f64> {
        self.amount_total.map(|minor| minor as f64 / 100.0)
    }
}

/// `customer.subscription.*` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(deserialize_with = "customer_ref")]
    pub customer: CustomerRef,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// `invoice.*` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: Value,
}

impl BillingEvent {
    /// Parses a payload whose signature has already been verified.
    pub(crate) fn from_slice(payload: &[u8]) -> Result<Self, WebhookError> {
        let raw: RawEvent =
            serde_json::from_slice(payload).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
        if raw.id.trim().is_empty() {
            return Err(WebhookError::InvalidPayload("empty event id".into()));
        }

        let object = raw.data.object;
        let kind = match raw.event_type.as_str() {
            CHECKOUT_COMPLETED => EventKind::CheckoutCompleted(decode(object)?),
            SUBSCRIPTION_CREATED => EventKind::SubscriptionCreated(decode(object)?),
            SUBSCRIPTION_UPDATED => EventKind::SubscriptionUpdated(decode(object)?),
            SUBSCRIPTION_DELETED => EventKind::SubscriptionDeleted(decode(object)?),
            INVOICE_PAYMENT_SUCCEEDED => EventKind::InvoicePaymentSucceeded(decode(object)?),
            INVOICE_PAYMENT_FAILED => EventKind::InvoicePaymentFailed(decode(object)?),
            _ => EventKind::Unhandled(raw.event_type),
        };
        Ok(Self {
            id: raw.id,
            created: raw.created,
            kind,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: Value) -> Result<T, WebhookError> {
    serde_json::from_value(object).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
}

/// Accepts every customer relation shape and normalises it.
fn customer_ref<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CustomerRef, D::Error> {
    let value = Value::deserialize(deserializer)?;
    CustomerRef::from_value(&value).map_err(serde::de::Error::custom)
}
