//! Token bucket accounting.
//!
//! Every bucket store, local or shared, applies the same refill formula:
//! `tokens = min(burst_size, tokens + elapsed * rate)`.

use std::time::Duration;

use crate::error::{GatehouseError, Result};

/// Refill rate and capacity shared by every bucket of one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens a bucket can hold
    pub burst_size: f64,
}

impl BucketPolicy {
    /// Build a policy from a requests-per-minute figure and a burst allowance.
    pub fn from_requests_per_minute(requests_per_minute: f64, burst_size: u32) -> Result<Self> {
        if !(requests_per_minute.is_finite() && requests_per_minute > 0.0) {
            return Err(GatehouseError::Config(format!(
                "requests_per_minute must be positive, got {}",
                requests_per_minute
            )));
        }
        if burst_size == 0 {
            return Err(GatehouseError::Config(
                "burst_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            rate: requests_per_minute / 60.0,
            burst_size: f64::from(burst_size),
        })
    }
}

/// Accounting state for one identity key.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    /// Available tokens, always within `[0, burst_size]`
    pub tokens: f64,
    /// Clock reading of the last refill
    pub last_refill: Duration,
    /// Admitted requests since the bucket was created
    pub request_count: u64,
}

impl TokenBucket {
    /// A bucket seen for the first time starts full.
    pub fn full(policy: &BucketPolicy, now: Duration) -> Self {
        Self {
            tokens: policy.burst_size,
            last_refill: now,
            request_count: 0,
        }
    }

    /// Credit the tokens accrued since the last refill.
    pub fn refill(&mut self, policy: &BucketPolicy, now: Duration) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * policy.rate).min(policy.burst_size);
        // A clock stepping backwards must not rewind last_refill either, or
        // the same interval would be credited twice.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Spend `cost` tokens if available.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            self.request_count += 1;
            true
        } else {
            false
        }
    }

    /// Seconds until the bucket holds at least `amount` tokens.
    pub fn seconds_until(&self, amount: f64, policy: &BucketPolicy) -> f64 {
        seconds_until(self.tokens, amount, policy)
    }
}

/// Seconds needed for `tokens` to grow to `amount` at the policy rate.
pub fn seconds_until(tokens: f64, amount: f64, policy: &BucketPolicy) -> f64 {
    if tokens >= amount {
        0.0
    } else {
        (amount - tokens) / policy.rate
    }
}
