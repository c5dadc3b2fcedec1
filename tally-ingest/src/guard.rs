//! Intake guard: per-source rate limiting
//!
//! A denial-of-service backstop, not a precise quota system. The trait
//! is the seam: the in-process governor-backed limiter is a
//! single-instance simplification, and a multi-instance deployment can
//! inject an implementation backed by a shared store.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota,
    RateLimiter as GovernorLimiter,
};

/// Per-caller admission decision.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, key: IpAddr) -> bool;
}

/// Keyed in-memory limiter: a request-count budget per caller address
/// within a rolling window, with periodic garbage collection of stale
/// per-key state.
pub struct KeyedRateLimiter {
    inner: GovernorLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
    checks: AtomicU64,
}

/// Sweep stale keys every this many admission checks.
const GC_EVERY: u64 = 1024;

impl KeyedRateLimiter {
    pub fn new(budget_per_window: u32, window_secs: u64) -> Self {
        let budget = NonZeroU32::new(budget_per_window.max(1)).expect("max(1) is nonzero");
        let replenish = Duration::from_secs(window_secs.max(1))
            .checked_div(budget.get())
            .unwrap_or(Duration::from_millis(1));
        let quota = Quota::with_period(replenish)
            .expect("nonzero replenish period")
            .allow_burst(budget);

        Self {
            inner: GovernorLimiter::keyed(quota),
            checks: AtomicU64::new(0),
        }
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn allow(&self, key: IpAddr) -> bool {
        let n = self.checks.fetch_add(1, Ordering::Relaxed);
        if n % GC_EVERY == GC_EVERY - 1 {
            self.inner.retain_recent();
        }

        let allowed = self.inner.check_key(&key).is_ok();
        if !allowed {
            tracing::warn!(caller = %key, "rate limit exceeded");
        }
        allowed
    }
}
