//! Error types for the licensing module.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessera_store::StoreError;
use tessera_types::EntitlementId;
use thiserror::Error;

use crate::config::ConfigError;
use crate::offline::CodeError;
use crate::token::TokenError;

/// Stable error codes returned across the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    ChallengeExpired,
    ChallengeInvalid,
    LeaseExpired,
    LeaseInvalid,
    ReplayRejected,
    InvalidSetupCode,
    InvalidPublicKey,
    InvalidRequestCode,
    SignatureVerificationFailed,
    EntitlementNotActive,
    DeviceNotOwned,
    MaxDevicesExceeded,
    LifetimeNotSupported,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ChallengeExpired => "CHALLENGE_EXPIRED",
            Self::ChallengeInvalid => "CHALLENGE_INVALID",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::LeaseInvalid => "LEASE_INVALID",
            Self::ReplayRejected => "REPLAY_REJECTED",
            Self::InvalidSetupCode => "INVALID_SETUP_CODE",
            Self::InvalidPublicKey => "INVALID_PUBLIC_KEY",
            Self::InvalidRequestCode => "INVALID_REQUEST_CODE",
            Self::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            Self::EntitlementNotActive => "ENTITLEMENT_NOT_ACTIVE",
            Self::DeviceNotOwned => "DEVICE_NOT_OWNED",
            Self::MaxDevicesExceeded => "MAX_DEVICES_EXCEEDED",
            Self::LifetimeNotSupported => "LIFETIME_NOT_SUPPORTED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Request input failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Challenge token is past its expiry.
    #[error("challenge expired")]
    ChallengeExpired,

    /// Challenge token is malformed, mis-signed or has the wrong purpose.
    #[error("invalid challenge: {0}")]
    ChallengeInvalid(String),

    /// Lease token is past its expiry.
    #[error("lease expired")]
    LeaseExpired,

    /// Lease token is malformed, mis-signed or has the wrong purpose.
    #[error("invalid lease: {0}")]
    LeaseInvalid(String),

    /// A single-use code was already consumed.
    #[error("code {jti} was already used")]
    ReplayRejected { jti: String },

    /// Device setup code failed validation.
    #[error("invalid setup code: {0}")]
    InvalidSetupCode(#[source] CodeError),

    /// Device public key could not be decoded.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Refresh or deactivation code failed validation.
    #[error("invalid request code: {0}")]
    InvalidRequestCode(#[source] CodeError),

    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Entitlement is not active.
    #[error("entitlement {0} is not active")]
    EntitlementNotActive(EntitlementId),

    /// Device or entitlement belongs to someone else.
    #[error("device is not owned by this customer or entitlement")]
    DeviceNotOwned,

    /// Device limit reached.
    #[error("device limit exceeded (max {0} devices)")]
    MaxDevicesExceeded(u32),

    /// Lifetime grants need no lease refresh.
    #[error("lifetime entitlements do not use leases")]
    LifetimeNotSupported,

    /// Too many requests for this customer.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Token could not be minted.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Signing key could not be loaded or encoded.
    #[error("key error: {0}")]
    Key(String),
}

impl LicenseError {
    /// Returns the stable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::ChallengeExpired => ErrorCode::ChallengeExpired,
            Self::ChallengeInvalid(_) => ErrorCode::ChallengeInvalid,
            Self::LeaseExpired => ErrorCode::LeaseExpired,
            Self::LeaseInvalid(_) => ErrorCode::LeaseInvalid,
            Self::ReplayRejected { .. } => ErrorCode::ReplayRejected,
            Self::InvalidSetupCode(_) => ErrorCode::InvalidSetupCode,
            Self::InvalidPublicKey(_) => ErrorCode::InvalidPublicKey,
            Self::InvalidRequestCode(_) => ErrorCode::InvalidRequestCode,
            Self::SignatureVerificationFailed => ErrorCode::SignatureVerificationFailed,
            Self::EntitlementNotActive(_) => ErrorCode::EntitlementNotActive,
            Self::DeviceNotOwned => ErrorCode::DeviceNotOwned,
            Self::MaxDevicesExceeded(_) => ErrorCode::MaxDevicesExceeded,
            Self::LifetimeNotSupported => ErrorCode::LifetimeNotSupported,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::Token(_) | Self::Store(_) | Self::Config(_) | Self::Key(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
