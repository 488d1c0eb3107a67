//! Shared test helpers for license tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use tessera_license::offline::{DeviceSetupCode, RequestKind, sign_request};
use tessera_license::{
    KeyProvider, LeaseConfig, LeaseService, OfflineConfig, ProvisioningService, RateLimiter,
    ServerKey, encode_public_key,
};
use tessera_store::{EntitlementRepo, MemoryStore, Repositories};
use tessera_types::{
    CustomerId, DeviceId, Entitlement, EntitlementId, EntitlementSource, Platform, Tier,
};

/// Returns a deterministic server key from a fixed seed.
pub fn server_key() -> ServerKey {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    ServerKey::from_seed(&seed)
}

/// Returns a deterministic device key; different `n` give different keys.
pub fn device_key(n: u8) -> SigningKey {
    SigningKey::from_bytes(&[n; 32])
}

/// SPKI DER, standard base64, as a device would send it.
pub fn public_key_b64(key: &SigningKey) -> String {
    encode_public_key(&key.verifying_key()).unwrap()
}

/// Fixed instant: 2025-01-15 12:00:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
}

pub fn lease_service() -> LeaseService {
    let keys: Arc<dyn KeyProvider> = Arc::new(server_key());
    LeaseService::new(keys, LeaseConfig::default())
}

/// Builds a `device_setup` code.
pub fn setup_code(device_id: &str, key: &SigningKey) -> String {
    DeviceSetupCode {
        device_id: DeviceId::new(device_id),
        device_name: Some("Workstation".into()),
        platform: Some(Platform::Linux),
        public_key: public_key_b64(key),
        created_at: now(),
    }
    .encode()
    .unwrap()
}

/// Builds a signed request code.
pub fn request_code(
    kind: RequestKind,
    device_id: &str,
    entitlement_id: EntitlementId,
    jti: &str,
    iat: i64,
    key: &SigningKey,
) -> String {
    sign_request(kind, DeviceId::new(device_id), entitlement_id, jti, iat, key)
        .encode()
        .unwrap()
}

/// A provisioning service over an in-memory store.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
    pub service: ProvisioningService,
    pub customer: CustomerId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(OfflineConfig::default(), None)
    }

    pub fn with_limiter(limiter: Arc<RateLimiter>) -> Self {
        Self::build(OfflineConfig::default(), Some(limiter))
    }

    fn build(offline: OfflineConfig, limiter: Option<Arc<RateLimiter>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let mut service = ProvisioningService::new(repos.clone(), lease_service(), offline);
        if let Some(limiter) = limiter {
            service = service.with_rate_limiter(limiter);
        }
        Self {
            store,
            repos,
            service,
            customer: CustomerId::new(),
        }
    }

    /// Inserts an active subscription entitlement for the fixture customer.
    pub fn entitlement(&self, tier: Tier) -> Entitlement {
        let ent = Entitlement::new(self.customer, tier, EntitlementSource::Subscription, now());
        self.repos.entitlements.insert_entitlement(&ent).unwrap();
        ent
    }

    /// Inserts a lifetime purchase entitlement for the fixture customer.
    pub fn lifetime_entitlement(&self, tier: Tier) -> Entitlement {
        let ent = Entitlement::new(self.customer, tier, EntitlementSource::Purchase, now())
            .into_lifetime();
        self.repos.entitlements.insert_entitlement(&ent).unwrap();
        ent
    }

    /// Registers `device_id` with `key` and binds it to `ent`.
    pub fn provision(&self, device_id: &str, key: &SigningKey, ent: &Entitlement) {
        self.service
            .register_device_setup(self.customer, &setup_code(device_id, key), now())
            .unwrap();
        self.service
            .activate_offline(self.customer, ent.id, &DeviceId::new(device_id), now())
            .unwrap();
    }
}
