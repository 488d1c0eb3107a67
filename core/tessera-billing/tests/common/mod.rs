//! Shared test helpers for billing tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_billing::{BillingEvent, Reconciler, WebhookVerifier};
use tessera_license::{FoundersWindow, TierMapper};
use tessera_store::{CustomerRepo, MemoryStore, Repositories};
use tessera_types::{Customer, CustomerId, Tier};

pub const SECRET: &str = "whsec_test_secret";

/// 2024-02-01 00:00:00 UTC, inside the founders window.
pub const IN_WINDOW: i64 = 1_706_745_600;

/// 2024-06-01 00:00:00 UTC, after the founders window.
pub const AFTER_WINDOW: i64 = 1_717_200_000;

/// Reconciliation time: 2024-06-02 00:00:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// Founders window covering Q1 2024.
pub fn tier_mapper() -> TierMapper {
    let window = FoundersWindow::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap()),
    )
    .unwrap();
    let prices = BTreeMap::from([
        ("price_maker".to_string(), Tier::Maker),
        ("price_pro".to_string(), Tier::Pro),
        ("price_enterprise".to_string(), Tier::Enterprise),
    ]);
    let amounts = BTreeMap::from([(49, Tier::Maker), (149, Tier::Pro), (499, Tier::Enterprise)]);
    TierMapper::new(prices, amounts, window)
}

pub fn verifier() -> WebhookVerifier {
    WebhookVerifier::new(SecretString::from(SECRET))
}

/// Signs `value` and runs it through the verifier, as a delivery would.
pub fn deliver(value: &Value) -> BillingEvent {
    let payload = serde_json::to_vec(value).unwrap();
    let header = verifier().sign(&payload, now().timestamp()).unwrap();
    verifier().construct_event_at(&payload, &header, now()).unwrap()
}

pub fn envelope(id: &str, event_type: &str, created: i64, object: Value) -> Value {
    json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object }
    })
}

/// A completed checkout with a price id in metadata.
pub fn checkout(
    event_id: &str,
    session_id: &str,
    mode: &str,
    customer: &str,
    price_id: Option<&str>,
    amount_total: Option<i64>,
    created: i64,
) -> BillingEvent {
    let mut object = json!({
        "id": session_id,
        "mode": mode,
        "customer": customer,
        "customer_email": "buyer@example.com",
        "currency": "usd",
        "created": created,
        "metadata": {}
    });
    if let Some(price_id) = price_id {
        object["metadata"]["price_id"] = json!(price_id);
    }
    if let Some(amount) = amount_total {
        object["amount_total"] = json!(amount);
    }
    if mode == "subscription" {
        object["subscription"] = json!(format!("sub_{session_id}"));
    }
    deliver(&envelope(event_id, "checkout.session.completed", created, object))
}

pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    subscription_id: &str,
    status: &str,
    created: i64,
) -> BillingEvent {
    deliver(&envelope(
        event_id,
        event_type,
        created,
        json!({
            "id": subscription_id,
            "customer": "cus_sub",
            "status": status,
            "current_period_end": created + 30 * 86_400,
            "cancel_at_period_end": false
        }),
    ))
}

pub fn invoice_event(event_id: &str, event_type: &str, subscription_id: &str, created: i64) -> BillingEvent {
    deliver(&envelope(
        event_id,
        event_type,
        created,
        json!({ "id": format!("in_{event_id}"), "subscription": subscription_id }),
    ))
}

/// A reconciler over an in-memory store.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
    pub reconciler: Reconciler,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let reconciler = Reconciler::new(repos.clone(), tier_mapper());
        Self {
            store,
            repos,
            reconciler,
        }
    }

    /// Inserts a customer known by our own id.
    pub fn customer(&self) -> CustomerId {
        let customer = Customer {
            id: CustomerId::new(),
            email: Some("known@example.com".into()),
            provider_customer_id: None,
            created_at: now(),
        };
        self.repos.customers.insert_customer(&customer).unwrap();
        customer.id
    }
}
