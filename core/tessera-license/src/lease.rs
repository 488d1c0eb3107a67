//! Lease, challenge and activation tokens.
//!
//! All three are stateless signed tokens; nothing is written on mint. Each
//! carries a `purpose` claim that verification checks before anything else,
//! so a token minted for one purpose is never accepted for another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_types::{CustomerId, DeviceId, EntitlementId, Tier};
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::keys::KeyProvider;
use crate::token::{self, TokenError};

/// `purpose` claim of lease tokens.
pub const PURPOSE_LEASE: &str = "lease";
/// `purpose` claim of challenge tokens.
pub const PURPOSE_CHALLENGE: &str = "challenge";
/// `purpose` claim of activation tokens.
pub const PURPOSE_ACTIVATION: &str = "activation";

/// Claims of a lease token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseClaims {
    pub purpose: String,
    pub entitlement_id: EntitlementId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub tier: Tier,
    pub is_lifetime: bool,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of a challenge token. The `jti` is the nonce echoed back by the
/// client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeClaims {
    pub purpose: String,
    pub entitlement_id: EntitlementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
    pub device_id: DeviceId,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of an activation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationClaims {
    pub purpose: String,
    pub entitlement_id: EntitlementId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub tier: Tier,
    pub is_lifetime: bool,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Input for [`LeaseService::mint_lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub entitlement_id: EntitlementId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub tier: Tier,
    pub is_lifetime: bool,
}

/// A freshly minted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    /// Expiry as an RFC 3339 string.
    #[must_use]
    pub fn expires_at_iso(&self) -> String {
        self.expires_at.to_rfc3339()
    }
}

/// Mints and verifies server-signed tokens.
#[derive(Clone)]
pub struct LeaseService {
    keys: Arc<dyn KeyProvider>,
    config: LeaseConfig,
}

impl LeaseService {
    #[must_use]
    pub fn new(keys: Arc<dyn KeyProvider>, config: LeaseConfig) -> Self {
        Self { keys, config }
    }

    #[must_use]
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Mints a lease, or returns `None` for lifetime entitlements, which
    /// need no lease.
    pub fn mint_lease(&self, request: &LeaseRequest) -> LicenseResult<Option<IssuedToken>> {
        self.mint_lease_at(request, Utc::now())
    }

    pub fn mint_lease_at(
        &self,
        request: &LeaseRequest,
        now: DateTime<Utc>,
    ) -> LicenseResult<Option<IssuedToken>> {
        if request.is_lifetime {
            return Ok(None);
        }
        let expires_at = now + self.config.lease_ttl();
        let claims = LeaseClaims {
            purpose: PURPOSE_LEASE.to_string(),
            entitlement_id: request.entitlement_id,
            customer_id: request.customer_id,
            device_id: request.device_id.clone(),
            tier: request.tier,
            is_lifetime: false,
            jti: new_jti(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = token::sign(self.keys.signing_key(), &claims)?;
        tracing::debug!(
            entitlement_id = %request.entitlement_id,
            device_id = %request.device_id,
            jti = %claims.jti,
            "minted lease"
        );
        Ok(Some(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        }))
    }

    pub fn verify_lease(&self, token: &str) -> LicenseResult<LeaseClaims> {
        self.verify_lease_at(token, Utc::now())
    }

    /// Checks signature, purpose and expiry, in that order.
    ///
    /// # Errors
    ///
    /// [`LicenseError::LeaseInvalid`] for a bad signature, malformed claims
    /// or any purpose other than `"lease"`; [`LicenseError::LeaseExpired`]
    /// once `exp` has passed.
    pub fn verify_lease_at(&self, token: &str, now: DateTime<Utc>) -> LicenseResult<LeaseClaims> {
        let claims: LeaseClaims = self
            .open_with_purpose(token, PURPOSE_LEASE)
            .map_err(LicenseError::LeaseInvalid)?;
        if claims.is_lifetime {
            return Err(LicenseError::LeaseInvalid(
                "lifetime entitlements are never leased".to_string(),
            ));
        }
        if now.timestamp() >= claims.exp {
            return Err(LicenseError::LeaseExpired);
        }
        Ok(claims)
    }

    /// Mints a short-lived challenge whose `jti` is the single-use nonce.
    pub fn mint_challenge(
        &self,
        entitlement_id: EntitlementId,
        customer_id: Option<CustomerId>,
        device_id: &DeviceId,
    ) -> LicenseResult<IssuedToken> {
        self.mint_challenge_at(entitlement_id, customer_id, device_id, Utc::now())
    }

    pub fn mint_challenge_at(
        &self,
        entitlement_id: EntitlementId,
        customer_id: Option<CustomerId>,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> LicenseResult<IssuedToken> {
        let expires_at = now + self.config.challenge_ttl();
        let claims = ChallengeClaims {
            purpose: PURPOSE_CHALLENGE.to_string(),
            entitlement_id,
            customer_id,
            device_id: device_id.clone(),
            jti: new_jti(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = token::sign(self.keys.signing_key(), &claims)?;
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    pub fn verify_challenge(&self, token: &str) -> LicenseResult<ChallengeClaims> {
        self.verify_challenge_at(token, Utc::now())
    }

    pub fn verify_challenge_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> LicenseResult<ChallengeClaims> {
        let claims: ChallengeClaims = self
            .open_with_purpose(token, PURPOSE_CHALLENGE)
            .map_err(LicenseError::ChallengeInvalid)?;
        if now.timestamp() >= claims.exp {
            return Err(LicenseError::ChallengeExpired);
        }
        Ok(claims)
    }

    /// Mints the activation token carried in an activation package.
    pub fn mint_activation_at(
        &self,
        request: &LeaseRequest,
        now: DateTime<Utc>,
    ) -> LicenseResult<IssuedToken> {
        let expires_at = now + self.config.activation_ttl();
        let claims = ActivationClaims {
            purpose: PURPOSE_ACTIVATION.to_string(),
            entitlement_id: request.entitlement_id,
            customer_id: request.customer_id,
            device_id: request.device_id.clone(),
            tier: request.tier,
            is_lifetime: request.is_lifetime,
            jti: new_jti(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = token::sign(self.keys.signing_key(), &claims)?;
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    /// Verifies an activation token. Failures are validation errors.
    pub fn verify_activation_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> LicenseResult<ActivationClaims> {
        let claims: ActivationClaims = self
            .open_with_purpose(token, PURPOSE_ACTIVATION)
            .map_err(|reason| LicenseError::Validation(format!("activation token: {reason}")))?;
        if now.timestamp() >= claims.exp {
            return Err(LicenseError::Validation(
                "activation token expired; request a new package".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Opens a token and rejects it unless its `purpose` matches. The
    /// purpose is read from a generic JSON view first so that a wrong
    /// purpose is reported as such rather than as a shape mismatch.
    fn open_with_purpose<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        purpose: &str,
    ) -> Result<T, String> {
        let key = self.keys.verifying_key();
        let raw: serde_json::Value = token::open(&key, token).map_err(describe)?;
        match raw.get("purpose").and_then(serde_json::Value::as_str) {
            Some(found) if found == purpose => {}
            Some(found) => return Err(format!("unexpected purpose {found:?}")),
            None => return Err("missing purpose".to_string()),
        }
        serde_json::from_value(raw).map_err(|e| format!("invalid claims: {e}"))
    }
}

fn describe(err: TokenError) -> String {
    match err {
        TokenError::Signature => "signature invalid".to_string(),
        other => other.to_string(),
    }
}

fn new_jti() -> String {
    Uuid::new_v4().to_string()
}
