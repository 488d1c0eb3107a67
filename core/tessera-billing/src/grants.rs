//! Grants and maintenance that do not come from provider events.

use chrono::{DateTime, Duration, Utc};
use tessera_types::{CustomerId, Entitlement, EntitlementSource, Tier};

use crate::error::{BillingError, BillingResult};
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Grants a time-boxed trial entitlement.
    ///
    /// A customer gets at most one trial, whatever its current status.
    ///
    /// # Errors
    ///
    /// [`BillingError::UnknownCustomer`], [`BillingError::TrialAlreadyGranted`]
    /// or [`BillingError::InvalidTrialLength`].
    pub fn grant_trial(
        &self,
        customer_id: &CustomerId,
        tier: Tier,
        days: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Entitlement> {
        let expires_at = (days > 0)
            .then(|| Duration::try_days(days))
            .flatten()
            .and_then(|length| now.checked_add_signed(length))
            .ok_or(BillingError::InvalidTrialLength(days))?;
        if self.repos.customers.get_customer(customer_id)?.is_none() {
            return Err(BillingError::UnknownCustomer(customer_id.to_string()));
        }

        let mut entitlement = Entitlement::new(*customer_id, tier, EntitlementSource::Trial, now);
        entitlement.expires_at = Some(expires_at);
        if !self.repos.entitlements.insert_trial(&entitlement)?.is_inserted() {
            return Err(BillingError::TrialAlreadyGranted(*customer_id));
        }

        tracing::info!(
            entitlement_id = %entitlement.id,
            customer_id = %customer_id,
            tier = %tier,
            days,
            "trial granted"
        );
        Ok(entitlement)
    }

    /// Marks non-lifetime entitlements past their expiry as expired.
    pub fn expire_lapsed(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let expired = self.repos.entitlements.expire_lapsed(now)?;
        if expired > 0 {
            tracing::info!(expired, "expired lapsed entitlements");
        } else {
            tracing::debug!("no lapsed entitlements");
        }
        Ok(expired)
    }
}
