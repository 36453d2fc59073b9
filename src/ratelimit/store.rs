//! Storage for token buckets.
//!
//! The limiter itself is stateless; bucket state lives behind [`BucketStore`]
//! so the same token math can run against process memory or a store shared by
//! several instances.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::{BucketPolicy, TokenBucket};
use crate::error::Result;

/// Outcome of a bucket operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    /// Whether the requested tokens were spent
    pub admitted: bool,
    /// Tokens left after the operation
    pub tokens: f64,
    /// Admitted requests since the bucket was created
    pub request_count: u64,
}

/// Backing storage for per-key token buckets.
///
/// Implementations must perform refill and consumption for one key as a
/// single atomic step.
pub trait BucketStore: Send + Sync {
    /// Refill the bucket for `key`, creating it full if unseen, then spend
    /// `cost` tokens if enough are available.
    fn acquire(
        &self,
        key: &str,
        cost: f64,
        policy: &BucketPolicy,
        now: Duration,
    ) -> Result<BucketSnapshot>;

    /// Refill the bucket for `key`, creating it full if unseen, without
    /// spending anything.
    fn peek(&self, key: &str, policy: &BucketPolicy, now: Duration) -> Result<BucketSnapshot>;

    /// Forget `key`. Returns whether a bucket existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Drop buckets whose last refill happened before `cutoff`.
    fn evict_idle(&self, cutoff: Duration) -> Result<usize>;

    /// Number of buckets currently held.
    fn len(&self) -> Result<usize>;

    /// Short name used in logs and stats.
    fn name(&self) -> &'static str;
}

/// Buckets kept in process memory behind a single lock.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the refilled bucket for `key` while holding the lock.
    fn with_bucket<T>(
        &self,
        key: &str,
        policy: &BucketPolicy,
        now: Duration,
        f: impl FnOnce(&mut TokenBucket) -> T,
    ) -> T {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, burst_size = policy.burst_size, "Creating new token bucket");
            TokenBucket::full(policy, now)
        });
        bucket.refill(policy, now);
        f(bucket)
    }
}

impl BucketStore for MemoryBucketStore {
    fn acquire(
        &self,
        key: &str,
        cost: f64,
        policy: &BucketPolicy,
        now: Duration,
    ) -> Result<BucketSnapshot> {
        Ok(self.with_bucket(key, policy, now, |bucket| {
            let admitted = bucket.try_consume(cost);
            trace!(key = %key, cost, admitted, tokens = bucket.tokens, "Token bucket checked");
            BucketSnapshot {
                admitted,
                tokens: bucket.tokens,
                request_count: bucket.request_count,
            }
        }))
    }

    fn peek(&self, key: &str, policy: &BucketPolicy, now: Duration) -> Result<BucketSnapshot> {
        Ok(self.with_bucket(key, policy, now, |bucket| BucketSnapshot {
            admitted: false,
            tokens: bucket.tokens,
            request_count: bucket.request_count,
        }))
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.buckets.lock().remove(key).is_some())
    }

    fn evict_idle(&self, cutoff: Duration) -> Result<usize> {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_refill >= cutoff);
        Ok(before - buckets.len())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.buckets.lock().len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
