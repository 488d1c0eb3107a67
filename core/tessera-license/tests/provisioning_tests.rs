//! End-to-end air-gapped and online provisioning flows.

mod common;

use chrono::Duration;
use common::{Fixture, device_key, now, request_code, setup_code};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tessera_license::offline::RequestKind;
use tessera_license::{
    ActivationPackage, ErrorCode, LicenseError, RateLimitConfig, RateLimiter, VerifiedCode,
};
use tessera_store::{DeviceRepo, EntitlementRepo, GuardedUpdate, Mutation};
use tessera_types::{CustomerId, DeviceId, Entitlement, EntitlementSource, EntitlementStatus, Tier};

// ── Setup ────────────────────────────────────────────────────────

#[test]
fn setup_code_is_idempotent_for_the_same_key() {
    let fx = Fixture::new();
    let key = device_key(1);
    let code = setup_code("dev-1", &key);

    let first = fx.service.register_device_setup(fx.customer, &code, now()).unwrap();
    let second = fx
        .service
        .register_device_setup(fx.customer, &code, now() + Duration::hours(1))
        .unwrap();

    assert_eq!(first.public_key, second.public_key);
    assert_eq!(second.created_at, now());
}

#[test]
fn setup_code_with_a_different_key_is_rejected() {
    let fx = Fixture::new();
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(1)), now())
        .unwrap();

    let err = fx
        .service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(2)), now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSetupCode);
}

#[test]
fn setup_for_another_customers_device_is_rejected() {
    let fx = Fixture::new();
    let code = setup_code("dev-1", &device_key(1));
    fx.service.register_device_setup(fx.customer, &code, now()).unwrap();

    let err = fx
        .service
        .register_device_setup(CustomerId::new(), &code, now())
        .unwrap_err();
    assert!(matches!(err, LicenseError::DeviceNotOwned));
}

#[test]
fn request_code_is_not_a_setup_code() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "jti-00000001",
        now().timestamp(),
        &device_key(1),
    );
    let err = fx
        .service
        .register_device_setup(fx.customer, &code, now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSetupCode);
}

// ── Activation ───────────────────────────────────────────────────

#[test]
fn activation_package_for_subscription_carries_a_lease() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &key), now())
        .unwrap();

    let package = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();

    assert!(package.lease_token.is_some());
    assert_eq!(package.lease_expires_at, Some(now() + Duration::days(7)));
    assert_eq!(package.entitlement_expires_at, None);

    let lease = fx
        .service
        .leases()
        .verify_lease_at(package.lease_token.as_deref().unwrap(), now())
        .unwrap();
    assert_eq!(lease.entitlement_id, ent.id);
    assert_eq!(lease.device_id.as_str(), "dev-1");

    let decoded = ActivationPackage::decode(&package.encode().unwrap()).unwrap();
    assert_eq!(decoded, package);
}

#[test]
fn lifetime_activation_has_no_lease() {
    let fx = Fixture::new();
    let ent = fx.lifetime_entitlement(Tier::Maker);
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(1)), now())
        .unwrap();

    let package = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();
    assert_eq!(package.lease_token, None);
    assert_eq!(package.lease_expires_at, None);
}

#[test]
fn trial_activation_reports_entitlement_expiry() {
    let fx = Fixture::new();
    let mut ent = Entitlement::new(fx.customer, Tier::Pro, EntitlementSource::Trial, now());
    ent.expires_at = Some(now() + Duration::days(14));
    fx.repos.entitlements.insert_entitlement(&ent).unwrap();
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(1)), now())
        .unwrap();

    let package = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();
    assert_eq!(package.entitlement_expires_at, ent.expires_at);
}

#[test]
fn device_limit_is_enforced() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Maker);
    assert_eq!(ent.max_devices, 2);

    fx.provision("dev-1", &device_key(1), &ent);
    fx.provision("dev-2", &device_key(2), &ent);
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-3", &device_key(3)), now())
        .unwrap();

    let err = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-3"), now())
        .unwrap_err();
    assert!(matches!(err, LicenseError::MaxDevicesExceeded(2)));
    assert_eq!(fx.repos.devices.count_bound(&ent.id).unwrap(), 2);
}

#[test]
fn reactivating_a_bound_device_does_not_count_twice() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Maker);
    fx.provision("dev-1", &device_key(1), &ent);
    fx.service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();
    assert_eq!(fx.repos.devices.count_bound(&ent.id).unwrap(), 1);
}

#[test]
fn activation_requires_completed_setup() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let err = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("ghost"), now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[test]
fn activation_of_someone_elses_entitlement_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let err = fx
        .service
        .activate_offline(CustomerId::new(), ent.id, &DeviceId::new("dev-1"), now())
        .unwrap_err();
    assert!(matches!(err, LicenseError::DeviceNotOwned));
}

#[test]
fn canceled_entitlement_cannot_activate() {
    let fx = Fixture::new();
    let mut ent = fx.entitlement(Tier::Pro);
    ent.status = EntitlementStatus::Canceled;
    fx.repos.entitlements.insert_entitlement(&ent).unwrap();
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(1)), now())
        .unwrap();

    let err = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EntitlementNotActive);
}

#[test]
fn activation_token_redeems_once() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &device_key(1)), now())
        .unwrap();
    let package = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();
    let device = DeviceId::new("dev-1");

    let claims = fx
        .service
        .redeem_activation(&package.activation_token, &device, now())
        .unwrap();
    assert_eq!(claims.entitlement_id, ent.id);

    let err = fx
        .service
        .redeem_activation(&package.activation_token, &device, now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplayRejected);
}

#[test]
fn activation_token_is_bound_to_its_device() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);
    let package = fx
        .service
        .activate_offline(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap();

    let err = fx
        .service
        .redeem_activation(&package.activation_token, &DeviceId::new("dev-2"), now())
        .unwrap_err();
    assert!(matches!(err, LicenseError::DeviceNotOwned));
}

// ── Refresh ──────────────────────────────────────────────────────

#[test]
fn offline_refresh_issues_a_lease_and_rejects_replay() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    let lease = fx.service.refresh_lease(&code, now()).unwrap();
    assert_eq!(lease.expires_at, now() + Duration::days(7));
    assert_eq!(fx.store.code_use_count(), 1);

    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert!(matches!(err, LicenseError::ReplayRejected { ref jti } if jti == "refresh-0001"));
    assert_eq!(fx.store.code_use_count(), 1);
}

#[test]
fn refresh_signed_with_another_key_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &device_key(9),
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SignatureVerificationFailed);
    assert_eq!(fx.store.code_use_count(), 0);
}

#[test]
fn failed_signature_does_not_burn_the_jti() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let forged = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &device_key(9),
    );
    assert!(fx.service.refresh_lease(&forged, now()).is_err());

    let genuine = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    assert!(fx.service.refresh_lease(&genuine, now()).is_ok());
}

#[test]
fn refresh_for_lifetime_entitlement_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.lifetime_entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::LifetimeNotSupported);
}

#[test]
fn stale_and_future_requests_are_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let too_old = now() - Duration::days(31);
    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-old1",
        too_old.timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequestCode);

    let future = now() + Duration::minutes(10);
    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-new1",
        future.timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequestCode);
}

#[test]
fn small_clock_skew_is_tolerated() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-skew",
        (now() + Duration::minutes(4)).timestamp(),
        &key,
    );
    assert!(fx.service.refresh_lease(&code, now()).is_ok());
}

#[test]
fn deactivation_code_cannot_refresh() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::Deactivation,
        "dev-1",
        ent.id,
        "deact-00001",
        now().timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequestCode);
}

#[test]
fn refresh_for_unbound_device_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.service
        .register_device_setup(fx.customer, &setup_code("dev-1", &key), now())
        .unwrap();

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert!(matches!(err, LicenseError::DeviceNotOwned));
}

#[test]
fn refresh_after_cancellation_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let outcome = fx
        .repos
        .entitlements
        .update_guarded(&ent.id, 100, now(), &mut |e: &mut Entitlement| {
            e.status = EntitlementStatus::Canceled;
            Mutation::Apply
        })
        .unwrap();
    assert!(matches!(outcome, GuardedUpdate::Applied(_)));

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::EntitlementNotActive);
}

#[test]
fn refresh_is_rate_limited_per_customer() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 2,
        window_secs: 60,
        cleanup_interval: 100,
    }));
    let fx = Fixture::with_limiter(limiter);
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    for n in 0..2 {
        let code = request_code(
            RequestKind::LeaseRefresh,
            "dev-1",
            ent.id,
            &format!("refresh-000{n}"),
            now().timestamp(),
            &key,
        );
        fx.service.refresh_lease(&code, now()).unwrap();
    }
    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0009",
        now().timestamp(),
        &key,
    );
    let err = fx.service.refresh_lease(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimited);
}

// ── Deactivation ─────────────────────────────────────────────────

#[test]
fn deactivation_frees_a_device_slot() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Maker);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);
    fx.provision("dev-2", &device_key(2), &ent);

    let code = request_code(
        RequestKind::Deactivation,
        "dev-1",
        ent.id,
        "deact-00001",
        now().timestamp(),
        &key,
    );
    let result = fx.service.deactivate(&code, now()).unwrap();
    assert_eq!(result.entitlement_id, ent.id);
    assert_eq!(fx.repos.devices.count_bound(&ent.id).unwrap(), 1);

    fx.provision("dev-3", &device_key(3), &ent);
    assert_eq!(fx.repos.devices.count_bound(&ent.id).unwrap(), 2);

    let err = fx.service.deactivate(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeviceNotOwned);
}

#[test]
fn deactivation_works_for_canceled_entitlements() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);
    fx.repos
        .entitlements
        .update_guarded(&ent.id, 100, now(), &mut |e: &mut Entitlement| {
            e.status = EntitlementStatus::Canceled;
            Mutation::Apply
        })
        .unwrap();

    let code = request_code(
        RequestKind::Deactivation,
        "dev-1",
        ent.id,
        "deact-00001",
        now().timestamp(),
        &key,
    );
    assert!(fx.service.deactivate(&code, now()).is_ok());
}

// ── Generic verification ─────────────────────────────────────────

#[test]
fn generic_verification_consumes_requests() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "generic-001",
        now().timestamp(),
        &key,
    );
    let verified = fx.service.parse_and_verify_offline_code(&code, now()).unwrap();
    assert!(matches!(verified, VerifiedCode::Request { ref entitlement, .. } if entitlement.id == ent.id));

    let err = fx.service.parse_and_verify_offline_code(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplayRejected);
}

#[test]
fn generic_verification_classifies_errors_by_type() {
    let fx = Fixture::new();
    let setup = serde_json::json!({"v": 1, "type": "device_setup", "deviceId": "dev-1"});
    let code = tessera_license::offline::encode_json(&setup).unwrap();
    let err = fx.service.parse_and_verify_offline_code(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSetupCode);

    let request = serde_json::json!({"v": 1, "type": "deactivation_code", "deviceId": "dev-1"});
    let code = tessera_license::offline::encode_json(&request).unwrap();
    let err = fx.service.parse_and_verify_offline_code(&code, now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequestCode);

    let err = fx.service.parse_and_verify_offline_code("not base64!", now()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[test]
fn generic_verification_accepts_setup_codes_without_side_effects() {
    let fx = Fixture::new();
    let code = setup_code("dev-1", &device_key(1));
    let verified = fx.service.parse_and_verify_offline_code(&code, now()).unwrap();
    assert!(matches!(verified, VerifiedCode::DeviceSetup(_)));
    assert!(fx.repos.devices.get_device(&DeviceId::new("dev-1")).unwrap().is_none());
}

// ── Online challenge ─────────────────────────────────────────────

#[test]
fn online_refresh_round_trip() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);
    let device = DeviceId::new("dev-1");

    let challenge = fx
        .service
        .issue_challenge(fx.customer, ent.id, &device, now())
        .unwrap();
    let lease = fx
        .service
        .complete_online_refresh(&challenge.token, &challenge.jti, &device, now())
        .unwrap();
    assert!(fx.service.leases().verify_lease_at(&lease.token, now()).is_ok());

    let err = fx
        .service
        .complete_online_refresh(&challenge.token, &challenge.jti, &device, now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReplayRejected);
}

#[test]
fn online_refresh_requires_matching_nonce() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);
    let device = DeviceId::new("dev-1");

    let challenge = fx
        .service
        .issue_challenge(fx.customer, ent.id, &device, now())
        .unwrap();
    let err = fx
        .service
        .complete_online_refresh(&challenge.token, "wrong-nonce", &device, now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChallengeInvalid);
}

#[test]
fn expired_challenge_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);
    let device = DeviceId::new("dev-1");

    let challenge = fx
        .service
        .issue_challenge(fx.customer, ent.id, &device, now())
        .unwrap();
    let later = now() + Duration::minutes(11);
    let err = fx
        .service
        .complete_online_refresh(&challenge.token, &challenge.jti, &device, later)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChallengeExpired);
}

#[test]
fn challenge_for_lifetime_entitlement_is_rejected() {
    let fx = Fixture::new();
    let ent = fx.lifetime_entitlement(Tier::Pro);
    fx.provision("dev-1", &device_key(1), &ent);
    let err = fx
        .service
        .issue_challenge(fx.customer, ent.id, &DeviceId::new("dev-1"), now())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LifetimeNotSupported);
}

// ── Ledger maintenance ───────────────────────────────────────────

#[test]
fn purge_removes_only_expired_uses() {
    let fx = Fixture::new();
    let ent = fx.entitlement(Tier::Pro);
    let key = device_key(1);
    fx.provision("dev-1", &key, &ent);

    let code = request_code(
        RequestKind::LeaseRefresh,
        "dev-1",
        ent.id,
        "refresh-0001",
        now().timestamp(),
        &key,
    );
    fx.service.refresh_lease(&code, now()).unwrap();

    assert_eq!(fx.service.purge_expired_codes(now() + Duration::days(1)).unwrap(), 0);
    assert_eq!(fx.service.purge_expired_codes(now() + Duration::days(31)).unwrap(), 1);
    assert_eq!(fx.store.code_use_count(), 0);
}
