//! Core type definitions for tessera.
//!
//! This crate defines the records shared by every component:
//! - Customer, entitlement, purchase and license key identifiers (UUID v7)
//! - Opaque client-chosen device identifiers
//! - Feature tiers and entitlement status
//! - Device records and air-gapped device identities
//! - Replay ledger and billing event ledger rows
//!
//! Behaviour lives in the service crates; the types here only carry data and
//! the invariants that can be checked locally.

mod customer;
mod device;
mod entitlement;
mod ids;
mod ledger;
mod purchase;
mod tier;

pub use customer::{Customer, CustomerRef};
pub use device::{Device, DeviceIdentity, Platform};
pub use entitlement::{
    Entitlement, EntitlementMetadata, EntitlementSource, EntitlementStatus, FoundersRepair,
};
pub use ids::{CustomerId, DeviceId, DeviceRecordId, EntitlementId, LicenseKeyId, PurchaseId};
pub use ledger::{CodeKind, InsertOutcome, OfflineCodeUse, ProcessedEvent};
pub use purchase::{LicenseKey, Purchase, PurchaseMode};
pub use tier::{Confidence, Tier};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid tier: {0}")]
    InvalidTier(String),

    #[error("invalid entitlement status: {0}")]
    InvalidStatus(String),

    #[error("invalid entitlement source: {0}")]
    InvalidSource(String),

    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    #[error("invalid purchase mode: {0}")]
    InvalidPurchaseMode(String),

    #[error("invalid code kind: {0}")]
    InvalidCodeKind(String),

    #[error("invalid customer reference: {0}")]
    InvalidCustomerRef(String),
}
