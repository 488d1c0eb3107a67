//! Per-customer rate limiting for device-facing operations.
//!
//! A sliding-window limiter keyed by customer id. It is constructed once at
//! startup and injected into the provisioning service; state is
//! per-process.
//!
//! Entries for idle customers are dropped by a cleanup pass that runs every
//! `cleanup_interval` checks, bounding memory under many distinct keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tessera_types::CustomerId;

use crate::config::RateLimitConfig;
use crate::error::{LicenseError, LicenseResult};

/// Sliding-window limiter keyed by customer.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<CustomerId, Vec<Instant>>>,
    checks: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            checks: AtomicU64::new(0),
        }
    }

    /// Records a request for `customer` if it is within the limit.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::RateLimited`] when the customer has used up
    /// the window.
    pub fn check(&self, customer: &CustomerId) -> LicenseResult<()> {
        self.check_at(customer, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(&self, customer: &CustomerId, now: Instant) -> LicenseResult<()> {
        let cutoff = self.cutoff(now);

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            tracing::debug!(checks = count, "running rate limiter cleanup");
            self.cleanup_at(now);
        }

        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(timestamps) = state.get(customer) {
                let recent = timestamps.iter().filter(|&&t| in_window(t, cutoff)).count();
                if recent >= self.config.max_requests as usize {
                    tracing::warn!(customer_id = %customer, requests = recent, "rate limit exceeded");
                    return Err(LicenseError::RateLimited);
                }
            }
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let timestamps = state.entry(*customer).or_default();
        timestamps.retain(|&t| in_window(t, cutoff));
        // Re-check under the write lock; another thread may have recorded
        // requests since the read.
        if timestamps.len() >= self.config.max_requests as usize {
            tracing::warn!(customer_id = %customer, requests = timestamps.len(), "rate limit exceeded");
            return Err(LicenseError::RateLimited);
        }
        timestamps.push(now);
        Ok(())
    }

    /// Drops customers with no requests inside the window.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let cutoff = self.cutoff(now);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.retain(|_, timestamps| {
            timestamps.retain(|&t| in_window(t, cutoff));
            !timestamps.is_empty()
        });
    }

    /// Number of customers currently tracked.
    #[must_use]
    pub fn tracked_customers(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Oldest instant still outside the window. `None` when the window
    /// reaches back past the clock's origin, so every request counts.
    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(Duration::from_secs(self.config.window_secs))
    }
}

fn in_window(t: Instant, cutoff: Option<Instant>) -> bool {
    cutoff.is_none_or(|cutoff| t > cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            cleanup_interval: 1000,
        })
    }

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = limiter(3);
        let customer = CustomerId::new();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at(&customer, now).is_ok());
        }
        assert!(matches!(
            limiter.check_at(&customer, now),
            Err(LicenseError::RateLimited)
        ));
    }

    #[test]
    fn customers_are_independent() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.check_at(&CustomerId::new(), now).is_ok());
        assert!(limiter.check_at(&CustomerId::new(), now).is_ok());
        assert_eq!(limiter.tracked_customers(), 2);
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(1);
        let customer = CustomerId::new();
        let start = Instant::now();
        assert!(limiter.check_at(&customer, start).is_ok());
        assert!(limiter.check_at(&customer, start + Duration::from_secs(30)).is_err());
        assert!(limiter.check_at(&customer, start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn cleanup_drops_idle_customers() {
        let limiter = limiter(5);
        let start = Instant::now();
        limiter.check_at(&CustomerId::new(), start).unwrap();
        limiter.cleanup_at(start + Duration::from_secs(120));
        assert_eq!(limiter.tracked_customers(), 0);
    }

    #[test]
    fn window_longer_than_uptime_still_limits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window_secs: u64::MAX,
            cleanup_interval: 1,
        });
        let customer = CustomerId::new();
        let now = Instant::now();
        assert!(limiter.check_at(&customer, now).is_ok());
        assert!(matches!(
            limiter.check_at(&customer, now + Duration::from_secs(1)),
            Err(LicenseError::RateLimited)
        ));
        limiter.cleanup_at(now + Duration::from_secs(2));
        assert_eq!(limiter.tracked_customers(), 1);
    }
}
