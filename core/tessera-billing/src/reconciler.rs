//! Applies billing events to entitlements.
//!
//! Deliveries are at-least-once and may arrive out of order. Each event goes
//! through the same steps:
//!
//! 1. skip if its id is already in the billing event ledger
//! 2. dispatch on the event type
//! 3. leave lifetime entitlements untouched
//! 4. apply only if the event is strictly newer than the last applied one
//! 5. persist the change together with the new `lastEventCreated`
//! 6. record the event id, only after the handler returned `Ok`
//!
//! Steps 3 to 5 run inside [`EntitlementRepo::update_guarded`], which the
//! backends make atomic per entitlement.
//!
//! [`EntitlementRepo::update_guarded`]: tessera_store::EntitlementRepo::update_guarded

use chrono::{DateTime, Utc};
use rand::Rng;
use tessera_license::{PurchaseAttrs, TierMapper};
use tessera_store::{GuardedUpdate, Mutation, Repositories};
use tessera_types::{
    Customer, CustomerRef, Entitlement, EntitlementId, EntitlementSource, EntitlementStatus,
    InsertOutcome, LicenseKey, LicenseKeyId, ProcessedEvent, Purchase, PurchaseId, PurchaseMode,
};

use crate::error::{BillingError, BillingResult};
use crate::event::{BillingEvent, CheckoutSession, EventKind, Invoice, Subscription};
use crate::status::map_subscription_status;

/// Reason recorded when a lifetime entitlement ignores an event.
pub const SKIP_LIFETIME: &str = "lifetime entitlement";

/// What reconciling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The event id was already recorded; nothing ran.
    AlreadyProcessed,
    /// A checkout created a purchase, license key and entitlement.
    Created {
        entitlement_id: EntitlementId,
        license_key: String,
    },
    /// An existing entitlement was updated.
    Applied { entitlement_id: EntitlementId },
    /// The handler declined to change anything.
    Skipped { reason: &'static str },
    /// The event is not newer than the last one applied.
    Stale {
        entitlement_id: EntitlementId,
        last_event_created: i64,
    },
    /// The event type is not handled.
    Ignored { event_type: String },
}

/// Billing reconciler.
pub struct Reconciler {
    pub(crate) repos: Repositories,
    tiers: TierMapper,
}

impl Reconciler {
    #[must_use]
    pub fn new(repos: Repositories, tiers: TierMapper) -> Self {
        Self { repos, tiers }
    }

    /// Reconciles one verified event.
    ///
    /// # Errors
    ///
    /// Returns an error, without recording the event, if a handler failed.
    /// The provider is expected to redeliver.
    pub fn reconcile(&self, event: &BillingEvent, now: DateTime<Utc>) -> BillingResult<ReconcileOutcome> {
        if self.repos.billing_events.is_processed(&event.id)? {
            tracing::debug!(event_id = %event.id, "event already processed");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let outcome = match &event.kind {
            EventKind::CheckoutCompleted(session) => self.on_checkout(event, session, now)?,
            EventKind::SubscriptionCreated(sub) | EventKind::SubscriptionUpdated(sub) => {
                self.on_subscription_changed(event, sub, now)?
            }
            EventKind::SubscriptionDeleted(sub) => self.on_subscription_deleted(event, sub, now)?,
            EventKind::InvoicePaymentSucceeded(invoice) => {
                self.on_invoice(event, invoice, true, now)?
            }
            EventKind::InvoicePaymentFailed(invoice) => {
                self.on_invoice(event, invoice, false, now)?
            }
            EventKind::Unhandled(event_type) => ReconcileOutcome::Ignored {
                event_type: event_type.clone(),
            },
        };

        let record = ProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.kind.event_type().to_string(),
            processed_at: now,
            event_created: event.created,
        };
        if self.repos.billing_events.record_processed(&record)? == InsertOutcome::Duplicate {
            // A concurrent delivery finished first; both applied the same
            // guarded update, so only one of them changed anything.
            tracing::debug!(event_id = %event.id, "event recorded concurrently");
        }

        tracing::info!(
            event_id = %event.id,
            event_type = event.kind.event_type(),
            outcome = ?outcome,
            "reconciled billing event"
        );
        Ok(outcome)
    }

    fn on_checkout(
        &self,
        event: &BillingEvent,
        session: &CheckoutSession,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconcileOutcome> {
        if self
            .repos
            .purchases
            .find_purchase_by_session(&session.id)?
            .is_some()
        {
            return Ok(ReconcileOutcome::Skipped {
                reason: "checkout already recorded",
            });
        }

        let customer = self.resolve_customer(&session.customer, session.customer_email.as_deref(), now)?;
        let created_at = timestamp(session.created)?;
        let attrs = PurchaseAttrs {
            price_id: session.price_id().map(str::to_string),
            amount: session.amount(),
            created_at,
        };
        let decision = self.tiers.determine(&attrs);

        let source = match session.mode {
            PurchaseMode::Payment => EntitlementSource::Purchase,
            PurchaseMode::Subscription => EntitlementSource::Subscription,
        };
        let mut entitlement = Entitlement::new(customer.id, decision.tier, source, now);
        entitlement.max_devices = decision.max_devices;
        match session.mode {
            // A subscription is never a lifetime grant.
            PurchaseMode::Subscription => {
                entitlement.stripe_subscription_id = session.subscription.clone();
            }
            PurchaseMode::Payment if decision.is_lifetime => {
                entitlement = entitlement.into_lifetime();
            }
            PurchaseMode::Payment => {
                entitlement.expires_at = Some(created_at + self.tiers.payment_term());
            }
        }
        entitlement.metadata.last_event_created = Some(event.created);
        entitlement.metadata.original_price_id = attrs.price_id.clone();
        entitlement.metadata.original_amount = attrs.amount;
        entitlement.metadata.tier_confidence = Some(decision.confidence);
        entitlement.metadata.needs_review = decision.needs_review();

        let purchase = Purchase {
            id: PurchaseId::new(),
            customer_id: customer.id,
            checkout_session_id: session.id.clone(),
            mode: session.mode,
            price_id: attrs.price_id,
            amount: attrs.amount,
            currency: session.currency.clone(),
            created_at,
        };
        let license_key = LicenseKey {
            id: LicenseKeyId::new(),
            purchase_id: purchase.id,
            entitlement_id: entitlement.id,
            key: generate_license_key(),
            created_at: now,
        };

        match self
            .repos
            .purchases
            .create_purchase_bundle(&purchase, &license_key, &entitlement)?
        {
            InsertOutcome::Duplicate => Ok(ReconcileOutcome::Skipped {
                reason: "checkout already recorded",
            }),
            InsertOutcome::Inserted => {
                if decision.needs_review() {
                    tracing::warn!(
                        entitlement_id = %entitlement.id,
                        checkout_session = %session.id,
                        "entitlement created with fallback tier; needs review"
                    );
                }
                tracing::info!(
                    entitlement_id = %entitlement.id,
                    customer_id = %customer.id,
                    tier = %entitlement.tier,
                    lifetime = entitlement.is_lifetime,
                    "entitlement created from checkout"
                );
                Ok(ReconcileOutcome::Created {
                    entitlement_id: entitlement.id,
                    license_key: license_key.key,
                })
            }
        }
    }

    fn on_subscription_changed(
        &self,
        event: &BillingEvent,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(entitlement) = self.repos.entitlements.find_by_subscription(&sub.id)? else {
            return Ok(ReconcileOutcome::Skipped {
                reason: "no entitlement for subscription",
            });
        };
        let status = map_subscription_status(&sub.status);
        let period_end = sub.current_period_end.and_then(|t| DateTime::from_timestamp(t, 0));

        self.apply(&entitlement.id, event, now, |e| {
            if let Some(status) = status {
                e.status = status;
            }
            e.current_period_end = period_end;
            e.cancel_at_period_end = sub.cancel_at_period_end;
            Mutation::Apply
        })
    }

    fn on_subscription_deleted(
        &self,
        event: &BillingEvent,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(entitlement) = self.repos.entitlements.find_by_subscription(&sub.id)? else {
            return Ok(ReconcileOutcome::Skipped {
                reason: "no entitlement for subscription",
            });
        };
        self.apply(&entitlement.id, event, now, |e| {
            e.status = EntitlementStatus::Canceled;
            e.cancel_at_period_end = false;
            Mutation::Apply
        })
    }

    fn on_invoice(
        &self,
        event: &BillingEvent,
        invoice: &Invoice,
        paid: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            return Ok(ReconcileOutcome::Skipped {
                reason: "invoice without subscription",
            });
        };
        let Some(entitlement) = self.repos.entitlements.find_by_subscription(subscription_id)? else {
            return Ok(ReconcileOutcome::Skipped {
                reason: "no entitlement for subscription",
            });
        };

        self.apply(&entitlement.id, event, now, |e| {
            match (paid, e.status) {
                (true, EntitlementStatus::Inactive) => {
                    e.status = EntitlementStatus::Active;
                    Mutation::Apply
                }
                (false, EntitlementStatus::Active) => {
                    e.status = EntitlementStatus::Inactive;
                    Mutation::Apply
                }
                (true, _) => Mutation::Skip("only inactive entitlements are reactivated"),
                (false, _) => Mutation::Skip("entitlement is not active"),
            }
        })
    }

    /// Guarded update with lifetime protection in front of `mutate`.
    fn apply(
        &self,
        id: &EntitlementId,
        event: &BillingEvent,
        now: DateTime<Utc>,
        mut mutate: impl FnMut(&mut Entitlement) -> Mutation,
    ) -> BillingResult<ReconcileOutcome> {
        let result = self.repos.entitlements.update_guarded(
            id,
            event.created,
            now,
            &mut |e: &mut Entitlement| {
                if e.is_lifetime {
                    return Mutation::Skip(SKIP_LIFETIME);
                }
                mutate(e)
            },
        )?;

        Ok(match result {
            GuardedUpdate::Applied(updated) => {
                tracing::info!(
                    entitlement_id = %updated.id,
                    status = %updated.status,
                    event_id = %event.id,
                    "entitlement updated"
                );
                ReconcileOutcome::Applied {
                    entitlement_id: updated.id,
                }
            }
            GuardedUpdate::Skipped(reason) => {
                tracing::debug!(entitlement_id = %id, reason, "event skipped");
                ReconcileOutcome::Skipped { reason }
            }
            GuardedUpdate::Stale { last_event_created } => {
                tracing::info!(
                    entitlement_id = %id,
                    event_created = event.created,
                    last_event_created,
                    "stale event ignored"
                );
                ReconcileOutcome::Stale {
                    entitlement_id: *id,
                    last_event_created,
                }
            }
            GuardedUpdate::NotFound => ReconcileOutcome::Skipped {
                reason: "entitlement not found",
            },
        })
    }

    fn resolve_customer(
        &self,
        customer: &CustomerRef,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<Customer> {
        match customer {
            CustomerRef::Id(id) => self
                .repos
                .customers
                .get_customer(id)?
                .ok_or_else(|| BillingError::UnknownCustomer(id.to_string())),
            CustomerRef::Provider(provider_id) => Ok(self
                .repos
                .customers
                .upsert_provider_customer(provider_id, email, now)?),
        }
    }
}

pub(crate) fn timestamp(secs: i64) -> BillingResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(BillingError::InvalidTimestamp(secs))
}

/// Unambiguous alphabet: no 0/O or 1/I.
const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// `TSR-XXXX-XXXX-XXXX-XXXX`.
fn generate_license_key() -> String {
    let mut rng = rand::thread_rng();
    let groups: Vec<String> = (0..4)
        .map(|_| {
            (0..4)
                .map(|_| char::from(KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())]))
                .collect()
        })
        .collect();
    format!("TSR-{}", groups.join("-"))
}
