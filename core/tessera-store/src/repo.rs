//! Repository interfaces.
//!
//! Services depend only on these traits. Every write that must be
//! linearizable (replay ledger inserts, guarded entitlement updates, device
//! binding) is a single trait method so a backend can make it atomic.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tessera_types::{
    Customer, CustomerId, Device, DeviceId, DeviceIdentity, Entitlement, EntitlementId,
    InsertOutcome, LicenseKey, OfflineCodeUse, ProcessedEvent, Purchase,
};

use crate::StoreResult;

/// Decision returned by the closure passed to
/// [`EntitlementRepo::update_guarded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// Persist the mutated entitlement and advance `lastEventCreated`.
    Apply,
    /// Leave the stored record untouched.
    Skip(&'static str),
}

/// Outcome of a guarded read-modify-write on an entitlement.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedUpdate {
    /// The mutation was persisted; carries the stored record.
    Applied(Entitlement),
    /// The closure declined to mutate.
    Skipped(&'static str),
    /// The event is not strictly newer than the last applied one.
    Stale {
        /// `lastEventCreated` currently stored.
        last_event_created: i64,
    },
    /// No entitlement with that id exists.
    NotFound,
}

/// Outcome of binding a device to an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The device is now bound to the entitlement.
    Bound,
    /// The device was already bound to this entitlement.
    AlreadyBound,
    /// Binding would exceed the entitlement's device limit.
    LimitReached,
    /// No device with that id is registered.
    DeviceNotFound,
}

/// Customer records.
pub trait CustomerRepo: Send + Sync {
    /// Inserts a new customer.
    fn insert_customer(&self, customer: &Customer) -> StoreResult<()>;

    /// Loads a customer by id.
    fn get_customer(&self, id: &CustomerId) -> StoreResult<Option<Customer>>;

    /// Loads a customer by the billing provider's customer id.
    fn find_customer_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Customer>>;

    /// Returns the customer for a provider id, creating it if missing.
    fn upsert_provider_customer(
        &self,
        provider_id: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Customer>;
}

/// Entitlement records.
pub trait EntitlementRepo: Send + Sync {
    /// Inserts a new entitlement.
    fn insert_entitlement(&self, entitlement: &Entitlement) -> StoreResult<()>;

    /// Inserts a trial entitlement unless the customer already has a trial,
    /// whatever its status. `Duplicate` (and nothing written) otherwise.
    fn insert_trial(&self, entitlement: &Entitlement) -> StoreResult<InsertOutcome>;

    /// Loads an entitlement by id.
    fn get_entitlement(&self, id: &EntitlementId) -> StoreResult<Option<Entitlement>>;

    /// Loads the entitlement tied to a provider subscription.
    fn find_by_subscription(&self, subscription_id: &str) -> StoreResult<Option<Entitlement>>;

    /// Lists a customer's entitlements, oldest first.
    fn list_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Entitlement>>;

    /// Transactional read-modify-write guarded by the event timestamp.
    ///
    /// Loads the entitlement, returns [`GuardedUpdate::Stale`] unless
    /// `event_created` is strictly newer than `metadata.lastEventCreated`,
    /// then runs `mutate` on a copy. On [`Mutation::Apply`] the copy is
    /// persisted with `lastEventCreated = event_created` and
    /// `updatedAt = now`. The whole sequence is atomic per entitlement.
    fn update_guarded(
        &self,
        id: &EntitlementId,
        event_created: i64,
        now: DateTime<Utc>,
        mutate: &mut dyn FnMut(&mut Entitlement) -> Mutation,
    ) -> StoreResult<GuardedUpdate>;

    /// Soft-retires non-lifetime entitlements whose expiry has passed.
    /// Returns the number of records marked expired.
    fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Device records and entitlement bindings.
pub trait DeviceRepo: Send + Sync {
    /// Loads a device by its client-chosen id.
    fn get_device(&self, device_id: &DeviceId) -> StoreResult<Option<Device>>;

    /// Inserts a device; `Duplicate` if the device id is already registered.
    fn insert_device(&self, device: &Device) -> StoreResult<InsertOutcome>;

    /// Updates the descriptive fields and `lastSeenAt` of a device.
    fn touch_device(&self, device: &Device) -> StoreResult<()>;

    /// Atomically binds a device to an entitlement, counting other devices
    /// already bound against `max_devices`.
    fn bind_device(
        &self,
        device_id: &DeviceId,
        entitlement_id: &EntitlementId,
        max_devices: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<BindOutcome>;

    /// Clears the binding if the device is bound to `entitlement_id`.
    /// Returns true if a binding was removed.
    fn unbind_device(&self, device_id: &DeviceId, entitlement_id: &EntitlementId)
    -> StoreResult<bool>;

    /// Number of devices bound to an entitlement.
    fn count_bound(&self, entitlement_id: &EntitlementId) -> StoreResult<u32>;

    /// Lists a customer's devices.
    fn list_devices_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Device>>;
}

/// Public keys bound to devices by air-gapped provisioning.
pub trait DeviceIdentityRepo: Send + Sync {
    /// Loads the identity bound to a device.
    fn get_identity(&self, device_id: &DeviceId) -> StoreResult<Option<DeviceIdentity>>;

    /// Inserts an identity; `Duplicate` if the device already has one.
    fn insert_identity(&self, identity: &DeviceIdentity) -> StoreResult<InsertOutcome>;
}

/// Purchases and license keys.
pub trait PurchaseRepo: Send + Sync {
    /// Loads a purchase by provider checkout session id.
    fn find_purchase_by_session(&self, checkout_session_id: &str) -> StoreResult<Option<Purchase>>;

    /// Atomically inserts a purchase with its license key and entitlement.
    /// `Duplicate` (and nothing written) if the session was already recorded.
    fn create_purchase_bundle(
        &self,
        purchase: &Purchase,
        license_key: &LicenseKey,
        entitlement: &Entitlement,
    ) -> StoreResult<InsertOutcome>;

    /// Loads the license key issued for an entitlement.
    fn license_key_for_entitlement(&self, entitlement_id: &EntitlementId)
    -> StoreResult<Option<LicenseKey>>;
}

/// Single-use code ledger.
pub trait ReplayLedger: Send + Sync {
    /// Insert-or-fail keyed by `jti`. `Duplicate` is the authoritative
    /// "already used" signal; callers must not pre-check existence.
    fn record_use(&self, code_use: &OfflineCodeUse) -> StoreResult<InsertOutcome>;

    /// Deletes uses whose `expiresAt` is before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Idempotency ledger for billing events.
pub trait BillingEventLedger: Send + Sync {
    /// Returns true if the event id was already recorded.
    fn is_processed(&self, event_id: &str) -> StoreResult<bool>;

    /// Records an event id; `Duplicate` if it was already recorded.
    fn record_processed(&self, event: &ProcessedEvent) -> StoreResult<InsertOutcome>;
}

/// Every repository, backed by one store.
#[derive(Clone)]
pub struct Repositories {
    pub customers: Arc<dyn CustomerRepo>,
    pub entitlements: Arc<dyn EntitlementRepo>,
    pub devices: Arc<dyn DeviceRepo>,
    pub identities: Arc<dyn DeviceIdentityRepo>,
    pub purchases: Arc<dyn PurchaseRepo>,
    pub replay: Arc<dyn ReplayLedger>,
    pub billing_events: Arc<dyn BillingEventLedger>,
}

impl Repositories {
    /// Wires every repository to the same backend.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: CustomerRepo
            + EntitlementRepo
            + DeviceRepo
            + DeviceIdentityRepo
            + PurchaseRepo
            + ReplayLedger
            + BillingEventLedger
            + 'static,
    {
        Self {
            customers: store.clone(),
            entitlements: store.clone(),
            devices: store.clone(),
            identities: store.clone(),
            purchases: store.clone(),
            replay: store.clone(),
            billing_events: store,
        }
    }
}
