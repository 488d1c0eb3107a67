mod common;

use common::{AFTER_WINDOW, Fixture, SECRET, envelope, now, verifier};
use proptest::prelude::*;
use secrecy::SecretString;
use serde_json::json;
use tessera_billing::{
    BillingError, EventKind, ReconcileOutcome, WebhookError, WebhookVerifier,
};

fn checkout_payload() -> Vec<u8> {
    serde_json::to_vec(&envelope(
        "evt_wh",
        "checkout.session.completed",
        AFTER_WINDOW,
        json!({
            "id": "cs_wh",
            "mode": "payment",
            "customer": {"id": "cus_wh"},
            "amount_total": 14_900,
            "created": AFTER_WINDOW,
        }),
    ))
    .unwrap()
}

#[test]
fn verified_delivery_reconciles() {
    let fx = Fixture::new();
    let payload = checkout_payload();
    let header = verifier().sign(&payload, now().timestamp()).unwrap();

    let event = verifier()
        .construct_event_at(&payload, &header, now())
        .unwrap();
    assert_eq!(event.id, "evt_wh");
    assert!(matches!(event.kind, EventKind::CheckoutCompleted(_)));

    let outcome = fx.reconciler.reconcile(&event, now()).unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Created { .. }));
}

#[test]
fn tampered_body_is_rejected() {
    let payload = checkout_payload();
    let header = verifier().sign(&payload, now().timestamp()).unwrap();
    let tampered = String::from_utf8(payload)
        .unwrap()
        .replace("14900", "1")
        .into_bytes();

    assert_eq!(
        verifier().construct_event_at(&tampered, &header, now()),
        Err(WebhookError::InvalidSignature)
    );
}

#[test]
fn rotated_secret_accepts_either_signature() {
    let payload = checkout_payload();
    let t = now().timestamp();
    let old = WebhookVerifier::new(SecretString::from("whsec_old"))
        .sign(&payload, t)
        .unwrap();
    let new = verifier().sign(&payload, t).unwrap();
    let old_sig = old.split_once(",v1=").unwrap().1;
    let new_sig = new.split_once(",v1=").unwrap().1;
    let header = format!("t={t},v1={old_sig},v1={new_sig}");

    assert!(verifier().construct_event_at(&payload, &header, now()).is_ok());
}

#[test]
fn signed_garbage_is_invalid_payload() {
    let payload = br#"{"id": "evt_1", "type": "checkout.session.completed"}"#;
    let header = verifier().sign(payload, now().timestamp()).unwrap();
    assert!(matches!(
        verifier().construct_event_at(payload, &header, now()),
        Err(WebhookError::InvalidPayload(_))
    ));
}

#[test]
fn future_timestamp_outside_tolerance() {
    let payload = checkout_payload();
    let header = verifier().sign(&payload, now().timestamp() + 301).unwrap();
    assert!(matches!(
        verifier().construct_event_at(&payload, &header, now()),
        Err(WebhookError::TimestampOutsideTolerance { age_secs: -301, .. })
    ));
}

#[test]
fn custom_tolerance_applies() {
    let payload = checkout_payload();
    let header = verifier().sign(&payload, now().timestamp() - 60).unwrap();
    let strict = WebhookVerifier::new(SecretString::from(SECRET)).with_tolerance(30);
    assert!(strict.construct_event_at(&payload, &header, now()).is_err());
    assert!(verifier().construct_event_at(&payload, &header, now()).is_ok());
}

#[test]
fn webhook_errors_convert_to_billing_errors() {
    let err: BillingError = WebhookError::InvalidSignature.into();
    assert_eq!(err.to_string(), "signature verification failed");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_byte_change_breaks_the_signature(index in any::<prop::sample::Index>(), flip in 1u8..=255) {
        let payload = checkout_payload();
        let header = verifier().sign(&payload, now().timestamp()).unwrap();

        let mut mutated = payload.clone();
        let i = index.index(mutated.len());
        mutated[i] ^= flip;

        prop_assert_eq!(
            verifier().verify_at(&mutated, &header, now()),
            Err(WebhookError::InvalidSignature)
        );
    }
}
