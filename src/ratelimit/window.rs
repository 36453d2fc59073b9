//! Sliding-window rate limiter.
//!
//! Keeps the instant of every admitted request inside the trailing window, so
//! "at most `limit` requests in any `window`" holds exactly. Cost per call is
//! O(requests in window).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::backend::{AdmissionControl, Algorithm, Decision, LimiterStats};
use super::clock::{Clock, SystemClock};
use crate::error::{GatehouseError, Result};

/// Admits at most `limit` requests per key in any trailing `window`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    log: Mutex<HashMap<String, VecDeque<Duration>>>,
    clock: Arc<dyn Clock>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl SlidingWindowLimiter {
    /// Create a limiter admitting `limit` requests per `window`.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GatehouseError::Config(
                "sliding window limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatehouseError::Config(
                "sliding window must be longer than zero".to_string(),
            ));
        }

        Ok(Self {
            limit,
            window,
            log: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one request for `key` if the window has room.
    pub fn is_allowed(&self, key: &str) -> bool {
        self.admit(key, 1).allowed
    }

    /// Requests still available to `key` in the current window.
    pub fn get_remaining(&self, key: &str) -> u64 {
        let now = self.clock.now();
        let mut log = self.log.lock();
        match log.get_mut(key) {
            Some(timestamps) => {
                self.prune(timestamps, now);
                u64::from(self.limit).saturating_sub(timestamps.len() as u64)
            }
            None => u64::from(self.limit),
        }
    }

    /// Forget every recorded request for `key`.
    pub fn reset(&self, key: &str) {
        let existed = self.log.lock().remove(key).is_some();
        debug!(key = %key, existed, "Sliding window reset");
    }

    /// Drop keys whose newest request is older than `max_age`.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now().saturating_sub(max_age);
        let mut log = self.log.lock();
        let before = log.len();
        log.retain(|_, timestamps| timestamps.back().is_some_and(|&newest| newest >= cutoff));
        let evicted = before - log.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle sliding windows");
        }
        evicted
    }

    /// Drop timestamps at or before the window start.
    fn prune(&self, timestamps: &mut VecDeque<Duration>, now: Duration) {
        let window_start = now.checked_sub(self.window);
        while let Some(&oldest) = timestamps.front() {
            match window_start {
                Some(start) if oldest <= start => {
                    timestamps.pop_front();
                }
                _ => break,
            }
        }
    }

    fn admit(&self, key: &str, cost: u32) -> Decision {
        let now = self.clock.now();
        let mut log = self.log.lock();
        let timestamps = log.entry(key.to_string()).or_default();
        self.prune(timestamps, now);

        let count = timestamps.len() as u64;
        let limit = u64::from(self.limit);
        let allowed = count + u64::from(cost) <= limit;

        if allowed {
            timestamps.extend(std::iter::repeat(now).take(cost as usize));
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, count, limit, "Sliding window limit exceeded");
        }

        let remaining = limit.saturating_sub(timestamps.len() as u64);
        let retry_after = self.retry_after(timestamps, now, cost);
        if timestamps.is_empty() {
            log.remove(key);
        }

        Decision {
            allowed,
            limit,
            remaining,
            retry_after,
        }
    }

    /// Time until enough recorded requests leave the window to fit `cost` more.
    fn retry_after(&self, timestamps: &VecDeque<Duration>, now: Duration, cost: u32) -> Duration {
        let limit = self.limit as usize;
        let cost = (cost.max(1) as usize).min(limit);
        let must_expire = (timestamps.len() + cost).saturating_sub(limit);
        if must_expire == 0 {
            return Duration::ZERO;
        }
        timestamps
            .get(must_expire - 1)
            .map(|&ts| {
                ts.checked_add(self.window)
                    .unwrap_or(Duration::MAX)
                    .saturating_sub(now)
            })
            .unwrap_or(Duration::ZERO)
    }
}

impl AdmissionControl for SlidingWindowLimiter {
    fn check(&self, key: &str, cost: u32) -> Decision {
        self.admit(key, cost)
    }

    fn reset(&self, key: &str) {
        SlidingWindowLimiter::reset(self, key);
    }

    fn cleanup_expired(&self, max_age: Duration) -> usize {
        SlidingWindowLimiter::cleanup_expired(self, max_age)
    }

    fn stats(&self) -> LimiterStats {
        LimiterStats {
            algorithm: Algorithm::SlidingWindow,
            tracked_keys: self.log.lock().len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn limiter(limit: u32, window_secs: u64) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::new(Duration::from_secs(500));
        let limiter = SlidingWindowLimiter::new(limit, Duration::from_secs(window_secs))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(SlidingWindowLimiter::new(0, Duration::from_secs(1)).is_err());
        assert!(SlidingWindowLimiter::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_window_exactness() {
        let (limiter, clock) = limiter(3, 10);

        for _ in 0..3 {
            assert!(limiter.is_allowed("k"));
        }
        assert!(!limiter.is_allowed("k"));

        // Exactly one window later the old requests sit on the boundary and expire.
        clock.advance(Duration::from_secs(10));
        assert!(limiter.is_allowed("k"));
    }

    #[test]
    fn test_rolls_over_after_window_plus_epsilon() {
        let (limiter, clock) = limiter(2, 5);
        assert!(limiter.is_allowed("k"));
        assert!(limiter.is_allowed("k"));
        assert!(!limiter.is_allowed("k"));

        clock.advance(Duration::from_millis(5_001));
        assert!(limiter.is_allowed("k"));
        assert_eq!(limiter.get_remaining("k"), 1);
    }

    #[test]
    fn test_partial_expiry() {
        let (limiter, clock) = limiter(2, 10);
        assert!(limiter.is_allowed("k"));
        clock.advance(Duration::from_secs(6));
        assert!(limiter.is_allowed("k"));
        assert!(!limiter.is_allowed("k"));

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.get_remaining("k"), 1);
        assert!(limiter.is_allowed("k"));
        assert!(!limiter.is_allowed("k"));
    }

    #[test]
    fn test_get_remaining_for_unknown_key() {
        let (limiter, _clock) = limiter(4, 10);
        assert_eq!(limiter.get_remaining("nobody"), 4);
        assert_eq!(limiter.stats().tracked_keys, 0);
    }

    #[test]
    fn test_check_with_cost_and_retry_after() {
        let (limiter, clock) = limiter(3, 10);

        let decision = limiter.check("k", 2);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);

        clock.advance(Duration::from_secs(4));
        let decision = limiter.check("k", 2);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 1);
        // The first recorded request leaves the window 6 seconds from now.
        assert_eq!(decision.retry_after, Duration::from_secs(6));

        assert!(limiter.check("k", 1).allowed);
        let decision = limiter.check("k", 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(6));
    }

    #[test]
    fn test_retry_after_saturates_for_huge_window() {
        let clock = ManualClock::new(Duration::from_secs(1_700_000_000));
        let limiter = SlidingWindowLimiter::new(1, Duration::MAX)
            .unwrap()
            .with_clock(Arc::new(clock));

        assert!(limiter.check("k", 1).allowed);
        let decision = limiter.check("k", 1);
        assert!(!decision.allowed);
        assert!(decision.retry_after > Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_reset_and_cleanup() {
        let (limiter, clock) = limiter(1, 10);
        assert!(limiter.is_allowed("a"));
        assert!(!limiter.is_allowed("a"));
        limiter.reset("a");
        assert!(limiter.is_allowed("a"));

        clock.advance(Duration::from_secs(30));
        assert!(limiter.is_allowed("b"));
        assert_eq!(limiter.cleanup_expired(Duration::from_secs(20)), 1);
        assert_eq!(limiter.stats().tracked_keys, 1);
    }

    #[test]
    fn test_concurrent_callers_respect_limit() {
        let (limiter, _clock) = limiter(40, 60);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..25).filter(|_| limiter.is_allowed("shared")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 40);
        assert_eq!(limiter.stats().rejected, 60);
    }
}
