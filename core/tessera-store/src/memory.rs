//! In-process store used by tests and single-process embedders.
//!
//! All state sits behind one mutex, so every trait method is atomic.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tessera_types::{
    Customer, CustomerId, Device, DeviceId, DeviceIdentity, Entitlement, EntitlementId,
    EntitlementStatus, InsertOutcome, LicenseKey, OfflineCodeUse, ProcessedEvent, Purchase,
};

use crate::repo::{
    BillingEventLedger, BindOutcome, CustomerRepo, DeviceIdentityRepo, DeviceRepo,
    EntitlementRepo, GuardedUpdate, Mutation, PurchaseRepo, ReplayLedger,
};
use crate::StoreResult;

#[derive(Default)]
struct State {
    customers: HashMap<CustomerId, Customer>,
    entitlements: HashMap<EntitlementId, Entitlement>,
    devices: HashMap<DeviceId, Device>,
    identities: HashMap<DeviceId, DeviceIdentity>,
    purchases: HashMap<String, Purchase>,
    license_keys: HashMap<EntitlementId, LicenseKey>,
    code_uses: HashMap<String, OfflineCodeUse>,
    events: HashMap<String, ProcessedEvent>,
}

/// Store that keeps every record in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of recorded single-use codes.
    #[must_use]
    pub fn code_use_count(&self) -> usize {
        self.state().code_uses.len()
    }

    /// Number of recorded billing events.
    #[must_use]
    pub fn processed_event_count(&self) -> usize {
        self.state().events.len()
    }
}

impl CustomerRepo for MemoryStore {
    fn insert_customer(&self, customer: &Customer) -> StoreResult<()> {
        self.state().customers.insert(customer.id, customer.clone());
        Ok(())
    }

    fn get_customer(&self, id: &CustomerId) -> StoreResult<Option<Customer>> {
        Ok(self.state().customers.get(id).cloned())
    }

    fn find_customer_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Customer>> {
        Ok(self
            .state()
            .customers
            .values()
            .find(|c| c.provider_customer_id.as_deref() == Some(provider_id))
            .cloned())
    }

    fn upsert_provider_customer(
        &self,
        provider_id: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Customer> {
        let mut state = self.state();
        if let Some(existing) = state
            .customers
            .values_mut()
            .find(|c| c.provider_customer_id.as_deref() == Some(provider_id))
        {
            if existing.email.is_none() {
                existing.email = email.map(str::to_string);
            }
            return Ok(existing.clone());
        }
        let customer = Customer {
            id: CustomerId::new(),
            email: email.map(str::to_string),
            provider_customer_id: Some(provider_id.to_string()),
            created_at: now,
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }
}

impl EntitlementRepo for MemoryStore {
    fn insert_entitlement(&self, entitlement: &Entitlement) -> StoreResult<()> {
        self.state()
            .entitlements
            .insert(entitlement.id, entitlement.clone());
        Ok(())
    }

    fn insert_trial(&self, entitlement: &Entitlement) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        let has_trial = state
            .entitlements
            .values()
            .any(|e| e.customer_id == entitlement.customer_id && e.is_trial());
        if has_trial {
            return Ok(InsertOutcome::Duplicate);
        }
        state.entitlements.insert(entitlement.id, entitlement.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn get_entitlement(&self, id: &EntitlementId) -> StoreResult<Option<Entitlement>> {
        Ok(self.state().entitlements.get(id).cloned())
    }

    fn find_by_subscription(&self, subscription_id: &str) -> StoreResult<Option<Entitlement>> {
        Ok(self
            .state()
            .entitlements
            .values()
            .find(|e| e.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    fn list_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Entitlement>> {
        let mut list: Vec<Entitlement> = self
            .state()
            .entitlements
            .values()
            .filter(|e| &e.customer_id == customer_id)
            .cloned()
            .collect();
        list.sort_by_key(|e| (e.created_at, e.id));
        Ok(list)
    }

    fn update_guarded(
        &self,
        id: &EntitlementId,
        event_created: i64,
        now: DateTime<Utc>,
        mutate: &mut dyn FnMut(&mut Entitlement) -> Mutation,
    ) -> StoreResult<GuardedUpdate> {
        let mut state = self.state();
        let Some(stored) = state.entitlements.get_mut(id) else {
            return Ok(GuardedUpdate::NotFound);
        };
        if let Some(last) = stored.metadata.last_event_created {
            if event_created <= last {
                return Ok(GuardedUpdate::Stale {
                    last_event_created: last,
                });
            }
        }
        let mut candidate = stored.clone();
        match mutate(&mut candidate) {
            Mutation::Skip(reason) => Ok(GuardedUpdate::Skipped(reason)),
            Mutation::Apply => {
                candidate.metadata.last_event_created = Some(event_created);
                candidate.updated_at = now;
                *stored = candidate.clone();
                Ok(GuardedUpdate::Applied(candidate))
            }
        }
    }

    fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state();
        let mut count = 0;
        for ent in state.entitlements.values_mut() {
            let lapsed = !ent.is_lifetime
                && matches!(
                    ent.status,
                    EntitlementStatus::Active | EntitlementStatus::Inactive
                )
                && ent.expires_at.is_some_and(|exp| exp <= now);
            if lapsed {
                ent.status = EntitlementStatus::Expired;
                ent.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl DeviceRepo for MemoryStore {
    fn get_device(&self, device_id: &DeviceId) -> StoreResult<Option<Device>> {
        Ok(self.state().devices.get(device_id).cloned())
    }

    fn insert_device(&self, device: &Device) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        if state.devices.contains_key(&device.device_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.devices.insert(device.device_id.clone(), device.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn touch_device(&self, device: &Device) -> StoreResult<()> {
        if let Some(stored) = self.state().devices.get_mut(&device.device_id) {
            stored.name = device.name.clone();
            stored.platform = device.platform;
            stored.last_seen_at = device.last_seen_at;
        }
        Ok(())
    }

    fn bind_device(
        &self,
        device_id: &DeviceId,
        entitlement_id: &EntitlementId,
        max_devices: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<BindOutcome> {
        let mut state = self.state();
        match state.devices.get(device_id) {
            None => return Ok(BindOutcome::DeviceNotFound),
            Some(d) if d.is_bound_to(entitlement_id) => return Ok(BindOutcome::AlreadyBound),
            Some(_) => {}
        }
        let bound = state
            .devices
            .values()
            .filter(|d| d.is_bound_to(entitlement_id))
            .count();
        if bound >= max_devices as usize {
            return Ok(BindOutcome::LimitReached);
        }
        if let Some(device) = state.devices.get_mut(device_id) {
            device.entitlement_id = Some(*entitlement_id);
            device.last_seen_at = now;
        }
        Ok(BindOutcome::Bound)
    }

    fn unbind_device(
        &self,
        device_id: &DeviceId,
        entitlement_id: &EntitlementId,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        match state.devices.get_mut(device_id) {
            Some(device) if device.is_bound_to(entitlement_id) => {
                device.entitlement_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn count_bound(&self, entitlement_id: &EntitlementId) -> StoreResult<u32> {
        let count = self
            .state()
            .devices
            .values()
            .filter(|d| d.is_bound_to(entitlement_id))
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn list_devices_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Device>> {
        let mut list: Vec<Device> = self
            .state()
            .devices
            .values()
            .filter(|d| &d.customer_id == customer_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(list)
    }
}

impl DeviceIdentityRepo for MemoryStore {
    fn get_identity(&self, device_id: &DeviceId) -> StoreResult<Option<DeviceIdentity>> {
        Ok(self.state().identities.get(device_id).cloned())
    }

    fn insert_identity(&self, identity: &DeviceIdentity) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        if state.identities.contains_key(&identity.device_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state
            .identities
            .insert(identity.device_id.clone(), identity.clone());
        Ok(InsertOutcome::Inserted)
    }
}

impl PurchaseRepo for MemoryStore {
    fn find_purchase_by_session(&self, checkout_session_id: &str) -> StoreResult<Option<Purchase>> {
        Ok(self.state().purchases.get(checkout_session_id).cloned())
    }

    fn create_purchase_bundle(
        &self,
        purchase: &Purchase,
        license_key: &LicenseKey,
        entitlement: &Entitlement,
    ) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        if state.purchases.contains_key(&purchase.checkout_session_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state
            .purchases
            .insert(purchase.checkout_session_id.clone(), purchase.clone());
        state
            .license_keys
            .insert(entitlement.id, license_key.clone());
        state.entitlements.insert(entitlement.id, entitlement.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn license_key_for_entitlement(
        &self,
        entitlement_id: &EntitlementId,
    ) -> StoreResult<Option<LicenseKey>> {
        Ok(self.state().license_keys.get(entitlement_id).cloned())
    }
}

impl ReplayLedger for MemoryStore {
    fn record_use(&self, code_use: &OfflineCodeUse) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        if state.code_uses.contains_key(&code_use.jti) {
            return Ok(InsertOutcome::Duplicate);
        }
        state
            .code_uses
            .insert(code_use.jti.clone(), code_use.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state();
        let before = state.code_uses.len();
        state
            .code_uses
            .retain(|_, u| u.expires_at.is_none_or(|exp| exp >= now));
        Ok(before - state.code_uses.len())
    }
}

impl BillingEventLedger for MemoryStore {
    fn is_processed(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self.state().events.contains_key(event_id))
    }

    fn record_processed(&self, event: &ProcessedEvent) -> StoreResult<InsertOutcome> {
        let mut state = self.state();
        if state.events.contains_key(&event.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.events.insert(event.event_id.clone(), event.clone());
        Ok(InsertOutcome::Inserted)
    }
}
