//! Payment provider webhooks and entitlement reconciliation for tessera.
//!
//! A delivery flows through two stages:
//!
//! 1. [`WebhookVerifier`] checks the HMAC signature header over the raw
//!    body and parses the verified body into a [`BillingEvent`]
//! 2. [`Reconciler`] applies the event to entitlements, idempotently by
//!    event id and in event-time order per entitlement
//!
//! The reconciler also grants trials and retires lapsed entitlements.
//!
//! # Ordering
//!
//! Providers deliver at least once and in no particular order. Each
//! entitlement remembers the `created` timestamp of the last event applied
//! to it, and an event that is not strictly newer is ignored. Lifetime
//! entitlements ignore every event.

mod error;
mod event;
mod grants;
mod reconciler;
mod signature;
mod status;

pub use error::{BillingError, BillingResult, WebhookError};
pub use event::{
    BillingEvent, CHECKOUT_COMPLETED, CheckoutSession, EventKind, INVOICE_PAYMENT_FAILED,
    INVOICE_PAYMENT_SUCCEEDED, Invoice, SUBSCRIPTION_CREATED, SUBSCRIPTION_DELETED,
    SUBSCRIPTION_UPDATED, Subscription,
};
pub use reconciler::{ReconcileOutcome, Reconciler, SKIP_LIFETIME};
pub use signature::{DEFAULT_TOLERANCE_SECS, WebhookVerifier};
pub use status::map_subscription_status;
