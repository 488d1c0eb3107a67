//! Device provisioning: air-gapped codes and online challenge/response.
//!
//! Entry points:
//!
//! - [`ProvisioningService::register_device_setup`] binds a device key
//! - [`ProvisioningService::activate_offline`] binds a device to an
//!   entitlement and assembles an activation package
//! - [`ProvisioningService::refresh_lease`] and
//!   [`ProvisioningService::deactivate`] handle device-signed requests
//! - [`ProvisioningService::issue_challenge`] and
//!   [`ProvisioningService::complete_online_refresh`] run the online refresh
//!
//! Signed requests are verified only against the key bound at setup, never
//! one carried in the request. A request's `jti` is consumed through a
//! single insert-or-fail on the replay ledger after every other check has
//! passed; a duplicate insert is the only "already used" signal.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tessera_store::{BindOutcome, Repositories, StoreError};
use tessera_types::{
    CodeKind, CustomerId, Device, DeviceId, DeviceIdentity, Entitlement, EntitlementId,
    InsertOutcome, OfflineCodeUse,
};

use crate::config::OfflineConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::keys::{decode_public_key, encode_public_key};
use crate::lease::{ActivationClaims, IssuedToken, LeaseRequest, LeaseService};
use crate::offline::{
    ActivationPackage, CodeError, DeviceSetupCode, OfflineCode, OfflineCodeKind, RequestKind,
    SignedRequest, parse_code, verify_request_signature,
};
use crate::rate_limit::RateLimiter;

/// A device code that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifiedCode {
    /// Schema-valid setup code; not yet registered.
    DeviceSetup(DeviceSetupCode),
    /// Signed request whose `jti` has now been consumed.
    Request {
        request: SignedRequest,
        device: Device,
        entitlement: Entitlement,
    },
}

/// Result of a successful deactivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deactivation {
    pub device_id: DeviceId,
    pub entitlement_id: EntitlementId,
}

/// Provisions devices against entitlements.
pub struct ProvisioningService {
    repos: Repositories,
    leases: LeaseService,
    offline: OfflineConfig,
    limiter: Option<Arc<RateLimiter>>,
}

impl ProvisioningService {
    #[must_use]
    pub fn new(repos: Repositories, leases: LeaseService, offline: OfflineConfig) -> Self {
        Self {
            repos,
            leases,
            offline,
            limiter: None,
        }
    }

    /// Applies a per-customer rate limit to refresh and deactivation.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn leases(&self) -> &LeaseService {
        &self.leases
    }

    // ── Air-gapped ───────────────────────────────────────────────

    /// Registers a device and permanently binds its public key.
    ///
    /// Re-submitting the same setup code is accepted; a different key for
    /// an already provisioned device is rejected.
    pub fn register_device_setup(
        &self,
        customer_id: CustomerId,
        code: &str,
        now: DateTime<Utc>,
    ) -> LicenseResult<DeviceIdentity> {
        let setup = match parse_code(code).map_err(LicenseError::InvalidSetupCode)? {
            OfflineCode::DeviceSetup(setup) => setup,
            other => {
                return Err(LicenseError::InvalidSetupCode(CodeError::WrongType {
                    expected: OfflineCodeKind::DeviceSetup.as_str(),
                    found: other.kind().as_str(),
                }));
            }
        };
        let public_key = encode_public_key(&decode_public_key(&setup.public_key)?)?;

        self.upsert_device(customer_id, &setup, now)?;

        let identity = DeviceIdentity {
            device_id: setup.device_id.clone(),
            public_key,
            created_at: now,
        };
        match self.repos.identities.insert_identity(&identity)? {
            InsertOutcome::Inserted => {
                tracing::info!(device_id = %identity.device_id, customer_id = %customer_id, "device key bound");
                Ok(identity)
            }
            InsertOutcome::Duplicate => {
                let existing = self
                    .repos
                    .identities
                    .get_identity(&identity.device_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("identity {}", identity.device_id)))?;
                if existing.public_key == identity.public_key {
                    Ok(existing)
                } else {
                    tracing::warn!(device_id = %identity.device_id, "setup with a different key rejected");
                    Err(LicenseError::InvalidSetupCode(CodeError::field(
                        "publicKey",
                        "device already has a different key bound",
                    )))
                }
            }
        }
    }

    fn upsert_device(
        &self,
        customer_id: CustomerId,
        setup: &DeviceSetupCode,
        now: DateTime<Utc>,
    ) -> LicenseResult<()> {
        if let Some(mut device) = self.repos.devices.get_device(&setup.device_id)? {
            if device.customer_id != customer_id {
                return Err(LicenseError::DeviceNotOwned);
            }
            device.name = setup.device_name.clone().or(device.name);
            device.platform = setup.platform.or(device.platform);
            device.last_seen_at = now;
            self.repos.devices.touch_device(&device)?;
            return Ok(());
        }

        let mut device = Device::new(customer_id, setup.device_id.clone(), now);
        device.name = setup.device_name.clone();
        device.platform = setup.platform;
        if self.repos.devices.insert_device(&device)? == InsertOutcome::Duplicate {
            // Lost a registration race; the winner must be the same customer.
            let winner = self.repos.devices.get_device(&setup.device_id)?;
            if winner.is_none_or(|d| d.customer_id != customer_id) {
                return Err(LicenseError::DeviceNotOwned);
            }
        }
        Ok(())
    }

    /// Binds a provisioned device to an entitlement and assembles the
    /// activation package for it.
    pub fn activate_offline(
        &self,
        customer_id: CustomerId,
        entitlement_id: EntitlementId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> LicenseResult<ActivationPackage> {
        let entitlement = self.owned_entitlement(customer_id, entitlement_id)?;
        if !entitlement.is_usable_at(now) {
            return Err(LicenseError::EntitlementNotActive(entitlement.id));
        }

        let device = self
            .repos
            .devices
            .get_device(device_id)?
            .ok_or_else(|| LicenseError::Validation(format!("device {device_id} is not registered")))?;
        if device.customer_id != customer_id {
            return Err(LicenseError::DeviceNotOwned);
        }
        if self.repos.identities.get_identity(device_id)?.is_none() {
            return Err(LicenseError::Validation(format!(
                "device {device_id} has not completed setup"
            )));
        }

        match self
            .repos
            .devices
            .bind_device(device_id, &entitlement.id, entitlement.max_devices, now)?
        {
            BindOutcome::Bound | BindOutcome::AlreadyBound => {}
            BindOutcome::LimitReached => {
                tracing::warn!(
                    entitlement_id = %entitlement.id,
                    device_id = %device_id,
                    max_devices = entitlement.max_devices,
                    "device limit reached"
                );
                return Err(LicenseError::MaxDevicesExceeded(entitlement.max_devices));
            }
            BindOutcome::DeviceNotFound => {
                return Err(LicenseError::Validation(format!(
                    "device {device_id} is not registered"
                )));
            }
        }

        let request = lease_request(&entitlement, device_id);
        let activation = self.leases.mint_activation_at(&request, now)?;
        let mut package = ActivationPackage::new(activation.token);
        if let Some(lease) = self.leases.mint_lease_at(&request, now)? {
            package.lease_token = Some(lease.token);
            package.lease_expires_at = Some(lease.expires_at);
        }
        if entitlement.is_trial() {
            package.entitlement_expires_at = entitlement.expires_at;
        }

        tracing::info!(
            entitlement_id = %entitlement.id,
            device_id = %device_id,
            lifetime = entitlement.is_lifetime,
            "device activated"
        );
        Ok(package)
    }

    /// Parses and fully verifies any device-to-server code.
    ///
    /// Setup codes are schema-checked only. Signed requests are checked for
    /// freshness, signature against the bound key and ownership, and their
    /// `jti` is consumed.
    pub fn parse_and_verify_offline_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> LicenseResult<VerifiedCode> {
        let parsed = parse_code(code).map_err(|err| classify_code_error(code, err))?;
        match parsed {
            OfflineCode::DeviceSetup(setup) => {
                decode_public_key(&setup.public_key)?;
                Ok(VerifiedCode::DeviceSetup(setup))
            }
            OfflineCode::Request(request) => {
                let (device, entitlement) = self.verify_signed(&request, now)?;
                self.consume_request(&request, &entitlement, now)?;
                Ok(VerifiedCode::Request {
                    request,
                    device,
                    entitlement,
                })
            }
        }
    }

    /// Issues a fresh lease for a signed offline refresh request.
    pub fn refresh_lease(&self, code: &str, now: DateTime<Utc>) -> LicenseResult<IssuedToken> {
        let request = parse_request(code, RequestKind::LeaseRefresh)?;
        let (mut device, entitlement) = self.verify_signed(&request, now)?;

        if entitlement.is_lifetime {
            return Err(LicenseError::LifetimeNotSupported);
        }
        if !entitlement.is_usable_at(now) {
            return Err(LicenseError::EntitlementNotActive(entitlement.id));
        }
        if !device.is_bound_to(&entitlement.id) {
            return Err(LicenseError::DeviceNotOwned);
        }

        self.consume_request(&request, &entitlement, now)?;
        device.last_seen_at = now;
        self.repos.devices.touch_device(&device)?;

        let lease = self
            .leases
            .mint_lease_at(&lease_request(&entitlement, &device.device_id), now)?
            .ok_or(LicenseError::LifetimeNotSupported)?;
        tracing::info!(
            entitlement_id = %entitlement.id,
            device_id = %device.device_id,
            jti = %request.jti,
            "offline lease refreshed"
        );
        Ok(lease)
    }

    /// Releases a device's entitlement binding on a signed request.
    pub fn deactivate(&self, code: &str, now: DateTime<Utc>) -> LicenseResult<Deactivation> {
        let request = parse_request(code, RequestKind::Deactivation)?;
        let (device, entitlement) = self.verify_signed(&request, now)?;
        if !device.is_bound_to(&entitlement.id) {
            return Err(LicenseError::DeviceNotOwned);
        }

        self.consume_request(&request, &entitlement, now)?;
        self.repos
            .devices
            .unbind_device(&device.device_id, &entitlement.id)?;
        tracing::info!(
            entitlement_id = %entitlement.id,
            device_id = %device.device_id,
            "device deactivated"
        );
        Ok(Deactivation {
            device_id: device.device_id,
            entitlement_id: entitlement.id,
        })
    }

    /// Redeems the activation token from a package, once.
    pub fn redeem_activation(
        &self,
        token: &str,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> LicenseResult<ActivationClaims> {
        let claims = self.leases.verify_activation_at(token, now)?;
        if &claims.device_id != device_id {
            return Err(LicenseError::DeviceNotOwned);
        }
        self.record_use(OfflineCodeUse {
            jti: claims.jti.clone(),
            kind: CodeKind::Activation,
            customer_id: claims.customer_id,
            entitlement_id: claims.entitlement_id,
            device_id: device_id.clone(),
            used_at: now,
            expires_at: DateTime::from_timestamp(claims.exp, 0),
        })?;
        tracing::info!(entitlement_id = %claims.entitlement_id, device_id = %device_id, "activation redeemed");
        Ok(claims)
    }

    // ── Online ───────────────────────────────────────────────────

    /// Mints a challenge for a device bound to an active, non-lifetime
    /// entitlement of the customer.
    pub fn issue_challenge(
        &self,
        customer_id: CustomerId,
        entitlement_id: EntitlementId,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> LicenseResult<IssuedToken> {
        self.rate_limit(&customer_id)?;
        let entitlement = self.owned_entitlement(customer_id, entitlement_id)?;
        if entitlement.is_lifetime {
            return Err(LicenseError::LifetimeNotSupported);
        }
        if !entitlement.is_usable_at(now) {
            return Err(LicenseError::EntitlementNotActive(entitlement.id));
        }
        let bound = self
            .repos
            .devices
            .get_device(device_id)?
            .is_some_and(|d| d.customer_id == customer_id && d.is_bound_to(&entitlement.id));
        if !bound {
            return Err(LicenseError::DeviceNotOwned);
        }
        self.leases
            .mint_challenge_at(entitlement.id, Some(customer_id), device_id, now)
    }

    /// Exchanges a challenge and its echoed nonce for a lease.
    pub fn complete_online_refresh(
        &self,
        challenge: &str,
        nonce: &str,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> LicenseResult<IssuedToken> {
        let claims = self.leases.verify_challenge_at(challenge, now)?;
        if claims.jti != nonce {
            return Err(LicenseError::ChallengeInvalid("nonce mismatch".to_string()));
        }
        if &claims.device_id != device_id {
            return Err(LicenseError::ChallengeInvalid("device mismatch".to_string()));
        }

        let entitlement = self
            .repos
            .entitlements
            .get_entitlement(&claims.entitlement_id)?
            .ok_or(LicenseError::DeviceNotOwned)?;
        if claims
            .customer_id
            .is_some_and(|c| c != entitlement.customer_id)
        {
            return Err(LicenseError::DeviceNotOwned);
        }
        self.rate_limit(&entitlement.customer_id)?;
        if entitlement.is_lifetime {
            return Err(LicenseError::LifetimeNotSupported);
        }
        if !entitlement.is_usable_at(now) {
            return Err(LicenseError::EntitlementNotActive(entitlement.id));
        }
        let bound = self
            .repos
            .devices
            .get_device(device_id)?
            .is_some_and(|d| d.is_bound_to(&entitlement.id));
        if !bound {
            return Err(LicenseError::DeviceNotOwned);
        }

        self.record_use(OfflineCodeUse {
            jti: claims.jti.clone(),
            kind: CodeKind::Refresh,
            customer_id: entitlement.customer_id,
            entitlement_id: entitlement.id,
            device_id: device_id.clone(),
            used_at: now,
            expires_at: DateTime::from_timestamp(claims.exp, 0),
        })?;

        let lease = self
            .leases
            .mint_lease_at(&lease_request(&entitlement, device_id), now)?
            .ok_or(LicenseError::LifetimeNotSupported)?;
        tracing::info!(entitlement_id = %entitlement.id, device_id = %device_id, "online lease refreshed");
        Ok(lease)
    }

    /// Garbage-collects replay ledger entries past their expiry.
    pub fn purge_expired_codes(&self, now: DateTime<Utc>) -> LicenseResult<usize> {
        let purged = self.repos.replay.purge_expired(now)?;
        if purged > 0 {
            tracing::info!(purged, "purged expired code uses");
        }
        Ok(purged)
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Freshness, bound-key signature and ownership checks. Does not
    /// consume the `jti`.
    fn verify_signed(
        &self,
        request: &SignedRequest,
        now: DateTime<Utc>,
    ) -> LicenseResult<(Device, Entitlement)> {
        let now_ts = now.timestamp();
        if request.iat > now_ts + self.offline.future_skew_secs {
            return Err(LicenseError::InvalidRequestCode(CodeError::field(
                "iat",
                "issued in the future",
            )));
        }
        if request.iat < now_ts - self.offline.request_max_age_secs {
            return Err(LicenseError::InvalidRequestCode(CodeError::field(
                "iat",
                "request is too old",
            )));
        }

        let device = self
            .repos
            .devices
            .get_device(&request.device_id)?
            .ok_or(LicenseError::DeviceNotOwned)?;
        self.rate_limit(&device.customer_id)?;

        let Some(identity) = self.repos.identities.get_identity(&request.device_id)? else {
            tracing::warn!(device_id = %request.device_id, "no key bound for device");
            return Err(LicenseError::SignatureVerificationFailed);
        };
        let key = decode_public_key(&identity.public_key)?;
        if let Err(err) = verify_request_signature(request, &key) {
            tracing::warn!(
                device_id = %request.device_id,
                kind = %request.kind.code_kind(),
                "offline code signature rejected"
            );
            return Err(err);
        }

        let entitlement = self
            .repos
            .entitlements
            .get_entitlement(&request.entitlement_id)?
            .ok_or(LicenseError::DeviceNotOwned)?;
        if entitlement.customer_id != device.customer_id {
            return Err(LicenseError::DeviceNotOwned);
        }
        Ok((device, entitlement))
    }

    fn consume_request(
        &self,
        request: &SignedRequest,
        entitlement: &Entitlement,
        now: DateTime<Utc>,
    ) -> LicenseResult<()> {
        // A request older than the freshness bound is rejected before it
        // reaches the ledger, so its entry can go after that.
        let retention = Duration::try_seconds(
            self.offline.request_max_age_secs.saturating_add(self.offline.future_skew_secs),
        );
        let retain_until = DateTime::from_timestamp(request.iat, 0)
            .zip(retention)
            .and_then(|(iat, retention)| iat.checked_add_signed(retention));
        self.record_use(OfflineCodeUse {
            jti: request.jti.clone(),
            kind: request.kind.ledger_kind(),
            customer_id: entitlement.customer_id,
            entitlement_id: entitlement.id,
            device_id: request.device_id.clone(),
            used_at: now,
            expires_at: retain_until,
        })
    }

    fn record_use(&self, code_use: OfflineCodeUse) -> LicenseResult<()> {
        match self.repos.replay.record_use(&code_use)? {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::Duplicate => {
                tracing::warn!(
                    jti = %code_use.jti,
                    kind = %code_use.kind,
                    device_id = %code_use.device_id,
                    "replay rejected"
                );
                Err(LicenseError::ReplayRejected { jti: code_use.jti })
            }
        }
    }

    fn owned_entitlement(
        &self,
        customer_id: CustomerId,
        entitlement_id: EntitlementId,
    ) -> LicenseResult<Entitlement> {
        match self.repos.entitlements.get_entitlement(&entitlement_id)? {
            Some(e) if e.customer_id == customer_id => Ok(e),
            _ => Err(LicenseError::DeviceNotOwned),
        }
    }

    fn rate_limit(&self, customer_id: &CustomerId) -> LicenseResult<()> {
        match &self.limiter {
            Some(limiter) => limiter.check(customer_id),
            None => Ok(()),
        }
    }
}

fn lease_request(entitlement: &Entitlement, device_id: &DeviceId) -> LeaseRequest {
    LeaseRequest {
        entitlement_id: entitlement.id,
        customer_id: entitlement.customer_id,
        device_id: device_id.clone(),
        tier: entitlement.tier,
        is_lifetime: entitlement.is_lifetime,
    }
}

fn parse_request(code: &str, expected: RequestKind) -> LicenseResult<SignedRequest> {
    match parse_code(code).map_err(LicenseError::InvalidRequestCode)? {
        OfflineCode::Request(request) if request.kind == expected => Ok(request),
        other => Err(LicenseError::InvalidRequestCode(CodeError::WrongType {
            expected: expected.code_kind().as_str(),
            found: other.kind().as_str(),
        })),
    }
}

/// Setup-code failures and request-code failures carry different codes;
/// when parsing failed the type is recovered from the envelope if possible.
fn classify_code_error(code: &str, err: CodeError) -> LicenseError {
    match crate::offline::peek_kind(code) {
        Some(OfflineCodeKind::DeviceSetup) => LicenseError::InvalidSetupCode(err),
        Some(_) => LicenseError::InvalidRequestCode(err),
        None => LicenseError::Validation(err.to_string()),
    }
}
