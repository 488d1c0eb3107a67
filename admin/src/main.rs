//! tessera operator CLI
//!
//! Runs the licensing core against the configured SQLite database:
//! key generation, tier checks, lease minting and verification, offline
//! provisioning, webhook reconciliation and maintenance sweeps.
//!
//! Usage:
//!   tessera-admin --config tessera.toml <COMMAND>
//!
//! Results go to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use tessera_admin::{App, AppConfig};
use tessera_license::{LeaseRequest, PurchaseAttrs, ServerKey};
use tessera_store::EntitlementRepo;
use tessera_types::{CustomerId, DeviceId, EntitlementId, Tier};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tessera-admin")]
#[command(about = "tessera licensing operator CLI")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "TESSERA_CONFIG", default_value = "tessera.toml")]
    config: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a server signing key (PKCS#8 PEM)
    Keygen {
        #[arg(short, long)]
        out: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show the tier decision for purchase attributes
    Tier {
        #[arg(long)]
        price_id: Option<String>,
        /// Amount in major currency units
        #[arg(long)]
        amount: Option<f64>,
        /// Purchase time (RFC 3339); defaults to now
        #[arg(long)]
        created_at: Option<DateTime<Utc>>,
    },
    /// Mint a lease for a device
    MintLease {
        #[arg(long)]
        entitlement: EntitlementId,
        #[arg(long)]
        device: String,
    },
    /// Verify a lease token and print its claims
    VerifyLease { token: String },
    /// Register a device setup code and return an activation package
    Activate {
        #[arg(long)]
        customer: CustomerId,
        #[arg(long)]
        entitlement: EntitlementId,
        #[arg(long)]
        setup_code: String,
    },
    /// Redeem an activation token for a device
    Redeem {
        #[arg(long)]
        token: String,
        #[arg(long)]
        device: String,
    },
    /// Exchange a signed lease refresh code for a lease
    Refresh { code: String },
    /// Unbind a device with a signed deactivation code
    Deactivate { code: String },
    /// Verify and reconcile a webhook delivery
    Reconcile {
        /// Raw request body
        #[arg(long)]
        payload: PathBuf,
        /// Signature header value
        #[arg(long)]
        signature: String,
    },
    /// Grant a trial entitlement
    GrantTrial {
        #[arg(long)]
        customer: CustomerId,
        #[arg(long, default_value = "pro")]
        tier: Tier,
        #[arg(long, default_value_t = 14)]
        days: i64,
    },
    /// Purge expired replay ledger entries
    Gc,
    /// Mark lapsed entitlements as expired
    Expire,
    /// Rewrite legacy "founders" tier records
    RepairFounders,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Command::Keygen { out, force } = &args.command {
        return keygen(out, *force);
    }

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let app = App::open(config).context("startup failed")?;
    run(&app, args.command)
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(app: &App, command: Command) -> Result<()> {
    let now = Utc::now();
    match command {
        Command::Keygen { out, force } => keygen(&out, force),
        Command::Tier {
            price_id,
            amount,
            created_at,
        } => {
            let decision = app.tiers.determine(&PurchaseAttrs {
                price_id,
                amount,
                created_at: created_at.unwrap_or(now),
            });
            print_json(&decision)
        }
        Command::MintLease {
            entitlement,
            device,
        } => {
            let ent = app
                .repos
                .entitlements
                .get_entitlement(&entitlement)?
                .with_context(|| format!("entitlement {entitlement} not found"))?;
            let request = LeaseRequest {
                entitlement_id: ent.id,
                customer_id: ent.customer_id,
                device_id: DeviceId::new(device),
                tier: ent.tier,
                is_lifetime: ent.is_lifetime,
            };
            match app.leases.mint_lease_at(&request, now)? {
                Some(lease) => print_json(&lease),
                None => print_json(&json!({ "lifetime": true, "lease": null })),
            }
        }
        Command::VerifyLease { token } => {
            let claims = app.leases.verify_lease_at(&token, now)?;
            print_json(&claims)
        }
        Command::Activate {
            customer,
            entitlement,
            setup_code,
        } => {
            let identity = app
                .provisioning
                .register_device_setup(customer, &setup_code, now)?;
            let package = app.provisioning.activate_offline(
                customer,
                entitlement,
                &identity.device_id,
                now,
            )?;
            print_json(&json!({
                "deviceId": identity.device_id,
                "package": package.encode()?,
            }))
        }
        Command::Redeem { token, device } => {
            let claims = app
                .provisioning
                .redeem_activation(&token, &DeviceId::new(device), now)?;
            print_json(&claims)
        }
        Command::Refresh { code } => {
            let lease = app.provisioning.refresh_lease(&code, now)?;
            print_json(&lease)
        }
        Command::Deactivate { code } => {
            let done = app.provisioning.deactivate(&code, now)?;
            print_json(&json!({
                "deviceId": done.device_id,
                "entitlementId": done.entitlement_id,
            }))
        }
        Command::Reconcile { payload, signature } => reconcile(app, &payload, &signature, now),
        Command::GrantTrial {
            customer,
            tier,
            days,
        } => {
            let trial = app.reconciler.grant_trial(&customer, tier, days, now)?;
            print_json(&trial)
        }
        Command::Gc => {
            let purged = app.provisioning.purge_expired_codes(now)?;
            print_json(&json!({ "purged": purged }))
        }
        Command::Expire => {
            let expired = app.reconciler.expire_lapsed(now)?;
            print_json(&json!({ "expired": expired }))
        }
        Command::RepairFounders => {
            let repaired = app.repair_legacy_founders()?;
            print_json(&json!({ "repaired": repaired }))
        }
    }
}

fn reconcile(app: &App, payload: &Path, signature: &str, now: DateTime<Utc>) -> Result<()> {
    let body = std::fs::read(payload)
        .with_context(|| format!("failed to read {}", payload.display()))?;
    let verifier = app.webhook_verifier()?;
    let event = verifier
        .construct_event_at(&body, signature, now)
        .context("webhook rejected")?;
    let outcome = app.reconciler.reconcile(&event, now)?;
    print_json(&json!({
        "eventId": event.id,
        "eventType": event.kind.event_type(),
        "outcome": format!("{outcome:?}"),
    }))
}

fn keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", out.display());
    }
    let key = ServerKey::generate();
    let pem = key.to_pkcs8_pem()?;
    std::fs::write(out, pem).with_context(|| format!("failed to write {}", out.display()))?;
    tracing::info!(path = %out.display(), "generated signing key");
    print_json(&json!({
        "path": out,
        "publicKey": key.public_key_spki_b64()?,
    }))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
