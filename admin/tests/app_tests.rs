use serde_json::json;
use std::path::Path;
use tessera_admin::{App, AppConfig, AppError};
use tessera_billing::ReconcileOutcome;
use tessera_license::{ConfigError, ServerKey};
use tessera_store::EntitlementRepo;

fn config_for(dir: &Path, key_file: &str) -> AppConfig {
    let mut config = AppConfig::from_toml_str(&format!(
        r#"
[database]
path = "{db}"

[keys]
signing_key = "{key}"

[tiers]
founders_start = "2024-01-01T00:00:00Z"
founders_end = "2024-03-31T23:59:59Z"
"#,
        db = dir.join("tessera.db").display(),
        key = dir.join(key_file).display(),
    ))
    .unwrap();
    config.webhook.secret = None;
    config
}

fn write_key(dir: &Path) -> ServerKey {
    let key = ServerKey::generate();
    std::fs::write(dir.join("signing.pem"), key.to_pkcs8_pem().unwrap()).unwrap();
    key
}

#[test]
fn opens_database_and_key() {
    let dir = tempfile::tempdir().unwrap();
    write_key(dir.path());

    let app = App::open(config_for(dir.path(), "signing.pem")).unwrap();
    assert!(dir.path().join("tessera.db").exists());
    assert_eq!(app.repair_legacy_founders().unwrap(), 0);
}

#[test]
fn missing_key_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let result = App::open(config_for(dir.path(), "absent.pem"));
    assert!(matches!(result, Err(AppError::Key(_))));
}

#[test]
fn webhook_requires_secret() {
    let dir = tempfile::tempdir().unwrap();
    write_key(dir.path());
    let app = App::open(config_for(dir.path(), "signing.pem")).unwrap();

    assert!(matches!(
        app.webhook_verifier(),
        Err(ConfigError::Missing("webhook.secret"))
    ));
}

#[test]
fn signed_delivery_creates_entitlement() {
    let dir = tempfile::tempdir().unwrap();
    write_key(dir.path());
    let mut config = config_for(dir.path(), "signing.pem");
    config.webhook.secret = Some("whsec_admin".into());
    let app = App::open(config).unwrap();

    let created = 1_706_745_600; // inside the founders window
    let payload = serde_json::to_vec(&json!({
        "id": "evt_admin",
        "type": "checkout.session.completed",
        "created": created,
        "data": {"object": {
            "id": "cs_admin",
            "mode": "payment",
            "customer": "cus_admin",
            "created": created,
            "metadata": {"price_id": "price_enterprise"}
        }}
    }))
    .unwrap();
    let now = chrono::Utc::now();
    let verifier = app.webhook_verifier().unwrap();
    let header = verifier.sign(&payload, now.timestamp()).unwrap();
    let event = verifier.construct_event_at(&payload, &header, now).unwrap();

    let ReconcileOutcome::Created { entitlement_id, .. } = app.reconciler.reconcile(&event, now).unwrap()
    else {
        panic!("expected Created");
    };
    let ent = app.repos.entitlements.get_entitlement(&entitlement_id).unwrap().unwrap();
    assert!(ent.is_lifetime);
    assert_eq!(ent.tier, tessera_types::Tier::Enterprise);
}
