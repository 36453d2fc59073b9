//! Admission control trait shared by the limiter algorithms.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Which algorithm a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => write!(f, "token_bucket"),
            Self::SlidingWindow => write!(f, "sliding_window"),
        }
    }
}

/// The result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Maximum requests the limiter admits at once (burst size or window limit)
    pub limit: u64,
    /// Whole requests still available after this check
    pub remaining: u64,
    /// How long until another request of the same cost could be admitted
    pub retry_after: Duration,
}

/// Counters describing a limiter's activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub algorithm: Algorithm,
    /// Identity keys currently holding state
    pub tracked_keys: usize,
    pub admitted: u64,
    pub rejected: u64,
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the token-bucket `RateLimiter` and the
/// `SlidingWindowLimiter` so callers can select either by configuration.
pub trait AdmissionControl: Send + Sync {
    /// Decide whether a unit of work costing `cost` may proceed for `key`.
    fn check(&self, key: &str, cost: u32) -> Decision;

    /// Forget all state for `key`.
    fn reset(&self, key: &str);

    /// Drop state for keys idle longer than `max_age`. Returns how many were dropped.
    fn cleanup_expired(&self, max_age: Duration) -> usize;

    /// Activity counters.
    fn stats(&self) -> LimiterStats;
}
