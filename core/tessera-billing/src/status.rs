//! Provider subscription status to entitlement status.

use tessera_types::EntitlementStatus;

/// Maps a provider subscription status.
///
/// Returns `None` for transitional statuses (`incomplete`, `paused`, ...),
/// which leave the entitlement status unchanged.
#[must_use]
pub fn map_subscription_status(provider_status: &str) -> Option<EntitlementStatus> {
    match provider_status.trim() {
        "active" | "trialing" => Some(EntitlementStatus::Active),
        "past_due" | "unpaid" => Some(EntitlementStatus::Inactive),
        "canceled" | "incomplete_expired" => Some(EntitlementStatus::Canceled),
        _ => None,
    }
}
