//! Limiter policy configuration.
//!
//! Policies are loaded from YAML and name the algorithm to run for each
//! protected surface, so callers can swap token bucket and sliding window
//! without code changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::backend::AdmissionControl;
use super::bucket::BucketPolicy;
use super::clock::Clock;
use super::limiter::RateLimiter;
use super::store::BucketStore;
use super::window::SlidingWindowLimiter;
use crate::error::{GatehouseError, Result};

/// One limiter's algorithm and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterPolicy {
    /// Steady rate with a burst allowance
    TokenBucket {
        requests_per_minute: f64,
        burst_size: u32,
    },
    /// At most `limit` requests in any trailing `window_secs`
    SlidingWindow { limit: u32, window_secs: f64 },
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        LimiterPolicy::TokenBucket {
            requests_per_minute: 60.0,
            burst_size: 10,
        }
    }
}

impl LimiterPolicy {
    /// Check parameter ranges without building anything.
    pub fn validate(&self) -> Result<()> {
        match *self {
            LimiterPolicy::TokenBucket {
                requests_per_minute,
                burst_size,
            } => BucketPolicy::from_requests_per_minute(requests_per_minute, burst_size).map(|_| ()),
            LimiterPolicy::SlidingWindow { limit, window_secs } => {
                if limit == 0 {
                    return Err(GatehouseError::Config(
                        "sliding window limit must be at least 1".to_string(),
                    ));
                }
                window_duration(window_secs).map(|_| ())
            }
        }
    }

    /// Build the limiter this policy describes.
    ///
    /// `store` only applies to token buckets; `None` keeps buckets in memory.
    pub fn build(
        &self,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn BucketStore>>,
    ) -> Result<Arc<dyn AdmissionControl>> {
        self.validate()?;
        match *self {
            LimiterPolicy::TokenBucket {
                requests_per_minute,
                burst_size,
            } => {
                let mut limiter = RateLimiter::new(requests_per_minute, burst_size)?.with_clock(clock);
                if let Some(store) = store {
                    limiter = limiter.with_store(store);
                }
                Ok(Arc::new(limiter))
            }
            LimiterPolicy::SlidingWindow { limit, window_secs } => {
                let limiter =
                    SlidingWindowLimiter::new(limit, window_duration(window_secs)?)?.with_clock(clock);
                Ok(Arc::new(limiter))
            }
        }
    }
}

/// Convert a configured window length, rejecting values a `Duration` cannot hold.
fn window_duration(window_secs: f64) -> Result<Duration> {
    if !(window_secs.is_finite() && window_secs > 0.0) {
        return Err(GatehouseError::Config(format!(
            "window_secs must be positive, got {}",
            window_secs
        )));
    }
    match Duration::try_from_secs_f64(window_secs) {
        Ok(window) if !window.is_zero() => Ok(window),
        _ => Err(GatehouseError::Config(format!(
            "window_secs {} is out of range",
            window_secs
        ))),
    }
}

/// Name under which the default policy is reported.
pub const DEFAULT_POLICY: &str = "default";

/// A default policy plus named overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policy used for names without an entry in `policies`
    #[serde(default)]
    pub default: LimiterPolicy,
    /// Named policies, e.g. `login` or `api`
    #[serde(default)]
    pub policies: HashMap<String, LimiterPolicy>,
}

impl PolicySet {
    /// Create a set with only the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml)
            .map_err(|e| GatehouseError::Config(format!("Failed to parse limiter policies: {}", e)))?;
        set.validate()?;
        Ok(set)
    }

    /// Validate every policy.
    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for (name, policy) in &self.policies {
            if name == DEFAULT_POLICY {
                return Err(GatehouseError::Config(format!(
                    "'{}' is reserved for the default policy; configure it under `default`",
                    DEFAULT_POLICY
                )));
            }
            policy
                .validate()
                .map_err(|e| GatehouseError::Config(format!("policy '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// The policy for `name`, falling back to the default.
    pub fn find(&self, name: &str) -> &LimiterPolicy {
        self.policies.get(name).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::Algorithm;
    use crate::ratelimit::clock::ManualClock;

    #[test]
    fn test_parse_policy_set() {
        let yaml = r#"
default:
  algorithm: token_bucket
  requests_per_minute: 120
  burst_size: 20
policies:
  login:
    algorithm: sliding_window
    limit: 5
    window_secs: 60
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();
        assert_eq!(
            set.default,
            LimiterPolicy::TokenBucket {
                requests_per_minute: 120.0,
                burst_size: 20
            }
        );
        assert_eq!(
            set.find("login"),
            &LimiterPolicy::SlidingWindow {
                limit: 5,
                window_secs: 60.0
            }
        );
        assert_eq!(set.find("unknown"), &set.default);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let set = PolicySet::from_yaml("policies: {}").unwrap();
        assert_eq!(set.default, LimiterPolicy::default());
    }

    #[test]
    fn test_invalid_policies_rejected() {
        let yaml = r#"
policies:
  broken:
    algorithm: sliding_window
    limit: 0
    window_secs: 60
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));

        assert!(PolicySet::from_yaml("default: { algorithm: leaky_bucket }").is_err());
        assert!(PolicySet::from_yaml("default: { algorithm: sliding_window, limit: 1, window_secs: 0 }").is_err());
        assert!(LimiterPolicy::TokenBucket {
            requests_per_minute: 0.0,
            burst_size: 1
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_oversized_window_rejected_before_build() {
        let yaml = r#"
policies:
  forever:
    algorithm: sliding_window
    limit: 1
    window_secs: 1.0e30
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("forever"));

        let policy = LimiterPolicy::SlidingWindow {
            limit: 1,
            window_secs: 1.0e30,
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        assert!(matches!(policy.build(clock, None), Err(GatehouseError::Config(_))));
    }

    #[test]
    fn test_default_is_a_reserved_policy_name() {
        let yaml = r#"
policies:
  default:
    algorithm: sliding_window
    limit: 5
    window_secs: 60
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_build_selects_algorithm() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());

        let bucket = LimiterPolicy::default().build(clock.clone(), None).unwrap();
        assert_eq!(bucket.stats().algorithm, Algorithm::TokenBucket);

        let window = LimiterPolicy::SlidingWindow {
            limit: 2,
            window_secs: 1.5,
        }
        .build(clock, None)
        .unwrap();
        assert_eq!(window.stats().algorithm, Algorithm::SlidingWindow);
        assert!(window.check("k", 1).allowed);
        assert!(window.check("k", 1).allowed);
        assert!(!window.check("k", 1).allowed);
    }
}
