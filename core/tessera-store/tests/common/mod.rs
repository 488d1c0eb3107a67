//! Fixtures shared by the store backend tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use tessera_types::{
    CodeKind, CustomerId, Device, DeviceId, Entitlement, EntitlementId, EntitlementSource,
    LicenseKey, LicenseKeyId, OfflineCodeUse, ProcessedEvent, Purchase, PurchaseId,
    PurchaseMode, Tier,
};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub fn entitlement(customer: CustomerId, tier: Tier) -> Entitlement {
    Entitlement::new(customer, tier, EntitlementSource::Subscription, at(1_700_000_000))
}

pub fn device(customer: CustomerId, id: &str) -> Device {
    Device::new(customer, DeviceId::new(id), at(1_700_000_000))
}

pub fn code_use(jti: &str, entitlement_id: EntitlementId, expires_at: Option<i64>) -> OfflineCodeUse {
    OfflineCodeUse {
        jti: jti.to_string(),
        kind: CodeKind::Refresh,
        customer_id: CustomerId::new(),
        entitlement_id,
        device_id: DeviceId::new("dev-1"),
        used_at: at(1_700_000_000),
        expires_at: expires_at.map(at),
    }
}

pub fn processed(event_id: &str, created: i64) -> ProcessedEvent {
    ProcessedEvent {
        event_id: event_id.to_string(),
        event_type: "customer.subscription.updated".to_string(),
        processed_at: at(created),
        event_created: created,
    }
}

pub fn purchase_bundle(
    customer: CustomerId,
    session: &str,
) -> (Purchase, LicenseKey, Entitlement) {
    let ent = Entitlement::new(customer, Tier::Pro, EntitlementSource::Purchase, at(1_700_000_000))
        .into_lifetime();
    let purchase = Purchase {
        id: PurchaseId::new(),
        customer_id: customer,
        checkout_session_id: session.to_string(),
        mode: PurchaseMode::Payment,
        price_id: Some("price_pro".to_string()),
        amount: Some(199.0),
        currency: Some("usd".to_string()),
        created_at: at(1_700_000_000),
    };
    let key = LicenseKey {
        id: LicenseKeyId::new(),
        purchase_id: purchase.id,
        entitlement_id: ent.id,
        key: format!("TSR-{session}"),
        created_at: at(1_700_000_000),
    };
    (purchase, key, ent)
}
