//! Rate limiting algorithms and state management.

mod backend;
mod bucket;
mod clock;
mod limiter;
#[cfg(feature = "redis")]
mod redis_store;
mod rules;
mod store;
mod window;

pub use backend::{AdmissionControl, Algorithm, Decision, LimiterStats};
pub use bucket::{BucketPolicy, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::RateLimiter;
#[cfg(feature = "redis")]
pub use redis_store::{RedisBucketStore, RedisStoreConfig};
pub use rules::{LimiterPolicy, PolicySet, DEFAULT_POLICY};
pub use store::{BucketSnapshot, BucketStore, MemoryBucketStore};
pub use window::SlidingWindowLimiter;
