//! Token-bucket rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use super::backend::{AdmissionControl, Algorithm, Decision, LimiterStats};
use super::bucket::{seconds_until, BucketPolicy};
use super::clock::{Clock, SystemClock};
use super::store::{BucketSnapshot, BucketStore, MemoryBucketStore};
use crate::error::Result;

/// Admits work per identity key under a steady rate with a burst allowance.
///
/// Buckets are refilled lazily on every access, so there is no background
/// task and accounting is exact regardless of the gap between calls. The
/// limiter is thread-safe and can be shared behind an `Arc`.
pub struct RateLimiter {
    policy: BucketPolicy,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    /// Decision to return when the store cannot be reached
    fail_open: bool,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create an in-memory limiter from a requests-per-minute figure and a burst size.
    pub fn new(requests_per_minute: f64, burst_size: u32) -> Result<Self> {
        let policy = BucketPolicy::from_requests_per_minute(requests_per_minute, burst_size)?;
        Ok(Self::with_policy(policy))
    }

    /// Create an in-memory limiter from an explicit policy.
    pub fn with_policy(policy: BucketPolicy) -> Self {
        Self {
            policy,
            store: Arc::new(MemoryBucketStore::new()),
            clock: Arc::new(SystemClock),
            fail_open: true,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Keep bucket state in `store` instead of process memory.
    pub fn with_store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = store;
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose whether requests are admitted when the store fails.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// The refill policy of this limiter.
    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Check whether `tokens_required` tokens may be spent for `key`.
    ///
    /// Returns `true` and spends the tokens when enough are available.
    pub fn is_allowed(&self, key: &str, tokens_required: u32) -> bool {
        self.acquire(key, tokens_required).admitted
    }

    /// Whole tokens left for `key` and seconds until one whole token is available.
    ///
    /// Applies the refill for elapsed time but spends nothing.
    pub fn get_remaining(&self, key: &str) -> (u64, f64) {
        let now = self.clock.now();
        match self.store.peek(key, &self.policy, now) {
            Ok(snapshot) => (
                snapshot.tokens.floor() as u64,
                seconds_until(snapshot.tokens, 1.0, &self.policy),
            ),
            Err(e) => {
                error!(key = %key, store = self.store.name(), error = %e, "Failed to read token bucket");
                if self.fail_open {
                    (self.policy.burst_size as u64, 0.0)
                } else {
                    (0, 1.0 / self.policy.rate)
                }
            }
        }
    }

    /// Forget `key`; its next request starts with a full bucket.
    pub fn reset(&self, key: &str) {
        match self.store.remove(key) {
            Ok(existed) => debug!(key = %key, existed, "Token bucket reset"),
            Err(e) => error!(key = %key, error = %e, "Failed to reset token bucket"),
        }
    }

    /// Drop buckets not touched within `max_age`.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now().saturating_sub(max_age);
        match self.store.evict_idle(cutoff) {
            Ok(evicted) => {
                if evicted > 0 {
                    debug!(evicted, store = self.store.name(), "Evicted idle token buckets");
                }
                evicted
            }
            Err(e) => {
                error!(error = %e, "Failed to evict idle token buckets");
                0
            }
        }
    }

    fn acquire(&self, key: &str, tokens_required: u32) -> BucketSnapshot {
        let now = self.clock.now();
        let cost = f64::from(tokens_required);

        let snapshot = match self.store.acquire(key, cost, &self.policy, now) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    key = %key,
                    store = self.store.name(),
                    fail_open = self.fail_open,
                    error = %e,
                    "Token bucket store failed"
                );
                BucketSnapshot {
                    admitted: self.fail_open,
                    tokens: 0.0,
                    request_count: 0,
                }
            }
        };

        if snapshot.admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, tokens_required, tokens = snapshot.tokens, "Rate limit exceeded");
        }
        trace!(key = %key, request_count = snapshot.request_count, "Admission decided");

        snapshot
    }
}

impl AdmissionControl for RateLimiter {
    fn check(&self, key: &str, cost: u32) -> Decision {
        let snapshot = self.acquire(key, cost);
        let wait = seconds_until(snapshot.tokens, f64::from(cost.max(1)), &self.policy);

        Decision {
            allowed: snapshot.admitted,
            limit: self.policy.burst_size as u64,
            remaining: snapshot.tokens.floor() as u64,
            retry_after: Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX),
        }
    }

    fn reset(&self, key: &str) {
        RateLimiter::reset(self, key);
    }

    fn cleanup_expired(&self, max_age: Duration) -> usize {
        RateLimiter::cleanup_expired(self, max_age)
    }

    fn stats(&self) -> LimiterStats {
        LimiterStats {
            algorithm: Algorithm::TokenBucket,
            tracked_keys: self.store.len().unwrap_or(0),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
