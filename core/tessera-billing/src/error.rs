//! Error types for webhook verification and reconciliation.

use tessera_store::StoreError;
use tessera_types::CustomerId;
use thiserror::Error;

/// Webhook verification and payload errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    /// The signature header is malformed.
    #[error("invalid signature header: {0}")]
    InvalidSignatureFormat(String),

    /// No `v1` signature matched the payload.
    #[error("signature verification failed")]
    InvalidSignature,

    /// The signed timestamp is too far from now.
    #[error("signature timestamp is {age_secs}s from now, tolerance is {tolerance_secs}s")]
    TimestampOutsideTolerance { age_secs: i64, tolerance_secs: i64 },

    /// The verified payload is not a well-formed event.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// Reconciliation errors.
///
/// These are returned to the caller so the provider redelivers; the event is
/// not marked as processed.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook verification failed.
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// An event references a customer that cannot be resolved.
    #[error("unknown customer: {0}")]
    UnknownCustomer(String),

    /// An event carries a timestamp outside the representable range.
    #[error("invalid event timestamp {0}")]
    InvalidTimestamp(i64),

    /// The customer already received a trial.
    #[error("customer {0} already has a trial")]
    TrialAlreadyGranted(CustomerId),

    /// Trial length is not positive or overflows the calendar.
    #[error("invalid trial length: {0} days")]
    InvalidTrialLength(i64),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;
