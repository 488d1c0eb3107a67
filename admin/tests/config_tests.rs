use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::PathBuf;
use tessera_admin::{AppConfig, AppConfigError, ENV_DATABASE_PATH, ENV_WEBHOOK_SECRET};
use tessera_license::{ConfigError, MAX_DURATION_SECS};

const MINIMAL: &str = r#"
[keys]
signing_key = "/etc/tessera/signing.pem"

[tiers]
founders_start = "2024-01-01T00:00:00Z"
founders_end = "2024-03-31T23:59:59Z"
"#;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name: &str| map.get(name).cloned()
}

#[test]
fn minimal_file_uses_defaults() {
    let config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.validate().unwrap();

    assert_eq!(config.database.path, PathBuf::from("tessera.db"));
    assert_eq!(config.lease.lease_ttl_secs, 7 * 24 * 60 * 60);
    assert_eq!(config.webhook.tolerance_secs, 300);
    assert_eq!(config.offline.future_skew_secs, 300);

    let mapper = config.tiers.build().unwrap();
    assert_eq!(mapper.tier_for_amount(199.0), Some(tessera_types::Tier::Pro));
}

#[test]
fn full_file_parses() {
    let config = AppConfig::from_toml_str(
        r#"
[database]
path = "/var/lib/tessera/tessera.db"

[keys]
signing_key = "/etc/tessera/signing.pem"

[lease]
lease_ttl_secs = 86400
challenge_ttl_secs = 300
activation_ttl_secs = 3600

[tiers]
founders_start = "2024-01-01T00:00:00Z"
founders_end = "2024-03-31T23:59:59Z"
payment_term_days = 30

[tiers.prices]
price_team = "enterprise"

[tiers.amounts]
"999" = "enterprise"

[webhook]
secret = "whsec_file"
tolerance_secs = 120

[rate_limit]
max_requests = 5
window_secs = 10
cleanup_interval = 50

[offline]
request_max_age_secs = 3600
future_skew_secs = 60
"#,
    )
    .unwrap();
    config.validate().unwrap();

    assert_eq!(config.database.path, PathBuf::from("/var/lib/tessera/tessera.db"));
    assert_eq!(config.lease.activation_ttl_secs, 3600);
    assert_eq!(config.rate_limit.max_requests, 5);
    assert_eq!(config.offline.request_max_age_secs, 3600);
    assert_eq!(config.webhook_secret().unwrap(), "whsec_file");

    let mapper = config.tiers.build().unwrap();
    assert_eq!(mapper.tier_for_price("price_team"), Some(tessera_types::Tier::Enterprise));
    assert_eq!(mapper.payment_term(), chrono::Duration::days(30));
    // Explicit tables replace the defaults.
    assert_eq!(mapper.tier_for_price("price_pro"), None);
}

#[test]
fn environment_overrides_file() {
    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.apply_overrides(env(&[
        (ENV_DATABASE_PATH, "/tmp/override.db"),
        (ENV_WEBHOOK_SECRET, "whsec_env"),
    ]));
    assert_eq!(config.database.path, PathBuf::from("/tmp/override.db"));
    assert_eq!(config.webhook_secret().unwrap(), "whsec_env");
}

#[test]
fn empty_override_is_ignored() {
    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.apply_overrides(env(&[(ENV_DATABASE_PATH, "  ")]));
    assert_eq!(config.database.path, PathBuf::from("tessera.db"));
}

#[test]
fn missing_signing_key_is_fatal() {
    let config = AppConfig::from_toml_str(
        r#"
[tiers]
founders_start = "2024-01-01T00:00:00Z"
founders_end = "2024-03-31T23:59:59Z"
"#,
    )
    .unwrap();
    assert_eq!(config.validate(), Err(ConfigError::Missing("keys.signing_key")));
}

#[test]
fn open_founders_window_is_fatal() {
    let config = AppConfig::from_toml_str(
        r#"
[keys]
signing_key = "k.pem"

[tiers]
founders_start = "2024-01-01T00:00:00Z"
"#,
    )
    .unwrap();
    assert_eq!(config.validate(), Err(ConfigError::UnboundedFoundersWindow));
}

#[test]
fn invalid_sections_are_fatal() {
    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.lease.challenge_ttl_secs = 0;
    assert_eq!(
        config.validate(),
        Err(ConfigError::NonPositive("lease.challenge_ttl_secs"))
    );

    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.rate_limit.window_secs = 0;
    assert_eq!(
        config.validate(),
        Err(ConfigError::NonPositive("rate_limit.window_secs"))
    );

    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.tiers.prices.insert("price_x".into(), "platinum".into());
    assert!(matches!(
        config.validate(),
        Err(ConfigError::UnknownTier { table: "tiers.prices", .. })
    ));
}

#[test]
fn oversized_durations_are_fatal_at_startup() {
    let config = AppConfig::from_toml_str(&format!(
        "{MINIMAL}\n[lease]\nlease_ttl_secs = {}\n",
        i64::MAX / 2
    ))
    .unwrap();
    assert_eq!(
        config.validate(),
        Err(ConfigError::TooLarge {
            name: "lease.lease_ttl_secs",
            max: MAX_DURATION_SECS
        })
    );

    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.webhook.tolerance_secs = i64::MAX;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::TooLarge { name: "webhook.tolerance_secs", .. })
    ));
}

#[test]
fn webhook_secret_required_only_on_demand() {
    let config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.validate().unwrap();
    assert_eq!(config.webhook_secret(), Err(ConfigError::Missing("webhook.secret")));
}

#[test]
fn secret_is_not_printed() {
    let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
    config.webhook.secret = Some("whsec_hidden".into());
    let debug = format!("{config:?}");
    assert!(!debug.contains("whsec_hidden"));
    assert!(debug.contains("[redacted]"));
}

#[test]
fn load_reports_unreadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        AppConfig::load(&missing),
        Err(AppConfigError::Read { .. })
    ));
}

#[test]
fn load_rejects_malformed_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tessera.toml");
    std::fs::write(&path, "[keys\nsigning_key = 1").unwrap();
    assert!(matches!(AppConfig::load(&path), Err(AppConfigError::Parse(_))));
}
