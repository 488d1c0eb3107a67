//! Licensing, leases and air-gapped provisioning for tessera.
//!
//! This crate handles:
//! - Tier determination from purchase attributes, including the founders
//!   window and legacy "founders" tier repair
//! - Server-signed lease, challenge and activation tokens
//! - Offline code parsing, canonical signing and verification
//! - Device provisioning against entitlements, with replay protection
//!
//! # Design Principles
//!
//! - **Lifetime grants never lease**: a lifetime entitlement is usable
//!   without any expiring token
//! - **Bound keys only**: a signed request is verified against the key the
//!   device registered at setup, never a key it carries
//! - **Single-use codes**: every `jti` is consumed through one
//!   insert-or-fail on the replay ledger
//!
//! # Token Format
//!
//! Tokens are formatted as `base64url(claims_json).base64url(signature)`,
//! the Ed25519 signature covering the encoded claims bytes.

mod config;
mod error;
mod keys;
mod lease;
pub mod offline;
mod provisioning;
mod rate_limit;
mod tier;
pub mod token;

pub use config::{
    ConfigError, LeaseConfig, MAX_DURATION_SECS, OfflineConfig, RateLimitConfig, TierConfig,
};
pub use error::{ErrorCode, LicenseError, LicenseResult};
pub use keys::{KeyProvider, ServerKey, decode_public_key, encode_public_key};
pub use lease::{
    ActivationClaims, ChallengeClaims, IssuedToken, LeaseClaims, LeaseRequest, LeaseService,
    PURPOSE_ACTIVATION, PURPOSE_CHALLENGE, PURPOSE_LEASE,
};
pub use offline::{ActivationPackage, CodeError, OfflineCode, OfflineCodeKind, RequestKind};
pub use provisioning::{Deactivation, ProvisioningService, VerifiedCode};
pub use rate_limit::RateLimiter;
pub use tier::{FoundersWindow, LEGACY_FOUNDERS_TIER, PurchaseAttrs, TierDecision, TierMapper};
