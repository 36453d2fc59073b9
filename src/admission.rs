//! Request admission glue for HTTP-style boundaries.
//!
//! [`AdmissionGate`] owns one limiter per configured policy and turns each
//! [`Decision`] into the status, headers and body a web framework should send.
//! It does not depend on any framework; handlers copy the values across.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::ratelimit::{
    AdmissionControl, BucketStore, Clock, Decision, LimiterStats, PolicySet, DEFAULT_POLICY,
};

/// Status code sent when a request is admitted.
pub const STATUS_OK: u16 = 200;
/// Status code sent when a request is rate limited.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// JSON body sent with a 429 response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectionBody {
    pub error: &'static str,
    pub retry_after: f64,
}

/// An admission decision rendered for an HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionResponse {
    pub decision: Decision,
}

impl AdmissionResponse {
    /// Whether the request may proceed.
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    /// 200 when admitted, 429 when rejected.
    pub fn status(&self) -> u16 {
        if self.decision.allowed {
            STATUS_OK
        } else {
            STATUS_TOO_MANY_REQUESTS
        }
    }

    /// Whole seconds a rejected caller should wait, never below one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.decision.retry_after.as_secs_f64().ceil() as u64;
        secs.max(1)
    }

    /// Response headers in the order they should be written.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.decision.limit.to_string()),
            ("X-RateLimit-Remaining", self.decision.remaining.to_string()),
        ];
        if !self.decision.allowed {
            headers.push((
                "X-RateLimit-Reset",
                format!("{:.3}", self.decision.retry_after.as_secs_f64()),
            ));
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }

    /// The JSON error body for a rejection, `None` when admitted.
    pub fn body(&self) -> Option<String> {
        if self.decision.allowed {
            return None;
        }
        let body = RejectionBody {
            error: "Rate limit exceeded",
            retry_after: self.decision.retry_after.as_secs_f64(),
        };
        serde_json::to_string(&body).ok()
    }
}

/// Limiters for every configured policy.
pub struct AdmissionGate {
    default: Arc<dyn AdmissionControl>,
    named: HashMap<String, Arc<dyn AdmissionControl>>,
}

impl AdmissionGate {
    /// Build one limiter per policy in `policies`.
    ///
    /// Token-bucket policies keep their buckets in `store` when given, each
    /// under its own key namespace.
    pub fn from_policies(
        policies: &PolicySet,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn BucketStore>>,
    ) -> Result<Self> {
        policies.validate()?;

        let default = policies.default.build(clock.clone(), store.clone())?;
        let mut named = HashMap::with_capacity(policies.policies.len());
        for (name, policy) in &policies.policies {
            let limiter = policy.build(clock.clone(), store.clone())?;
            named.insert(name.clone(), limiter);
        }

        info!(policies = named.len(), "Admission gate initialized");
        Ok(Self { default, named })
    }

    /// Check `key` against the limiter for `policy`.
    pub fn check(&self, policy: &str, key: &str, cost: u32) -> AdmissionResponse {
        let limiter = self.named.get(policy).unwrap_or(&self.default);
        // Named policies share a store, so keys are namespaced per policy.
        let scoped = format!("{}:{}", policy, key);
        let decision = limiter.check(&scoped, cost);
        debug!(policy = %policy, key = %key, allowed = decision.allowed, "Admission checked");
        AdmissionResponse { decision }
    }

    /// Forget `key` under `policy`.
    pub fn reset(&self, policy: &str, key: &str) {
        let limiter = self.named.get(policy).unwrap_or(&self.default);
        limiter.reset(&format!("{}:{}", policy, key));
    }

    /// Sweep idle keys from every limiter.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let evicted = self.default.cleanup_expired(max_age)
            + self
                .named
                .values()
                .map(|limiter| limiter.cleanup_expired(max_age))
                .sum::<usize>();
        if evicted > 0 {
            info!(evicted, "Admission gate cleanup");
        }
        evicted
    }

    /// Stats per policy, with the default under [`DEFAULT_POLICY`].
    pub fn stats(&self) -> BTreeMap<String, LimiterStats> {
        let mut stats: BTreeMap<String, LimiterStats> = self
            .named
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.stats()))
            .collect();
        stats.insert(DEFAULT_POLICY.to_string(), self.default.stats());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn gate() -> (AdmissionGate, ManualClock) {
        let yaml = r#"
default:
  algorithm: token_bucket
  requests_per_minute: 60
  burst_size: 2
policies:
  login:
    algorithm: sliding_window
    limit: 1
    window_secs: 30
"#;
        let policies = PolicySet::from_yaml(yaml).unwrap();
        let clock = ManualClock::new(Duration::from_secs(100));
        let gate = AdmissionGate::from_policies(&policies, Arc::new(clock.clone()), None).unwrap();
        (gate, clock)
    }

    #[test]
    fn test_admitted_response() {
        let (gate, _clock) = gate();
        let response = gate.check("api", "alice", 1);

        assert!(response.allowed());
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers(),
            vec![
                ("X-RateLimit-Limit", "2".to_string()),
                ("X-RateLimit-Remaining", "1".to_string()),
            ]
        );
        assert_eq!(response.body(), None);
    }

    #[test]
    fn test_rejected_response() {
        let (gate, _clock) = gate();
        gate.check("api", "alice", 1);
        gate.check("api", "alice", 1);
        let response = gate.check("api", "alice", 1);

        assert_eq!(response.status(), 429);
        let headers = response.headers();
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
        assert!(headers.contains(&("X-RateLimit-Reset", "1.000".to_string())));
        assert!(headers.contains(&("Retry-After", "1".to_string())));

        let body: serde_json::Value = serde_json::from_str(&response.body().unwrap()).unwrap();
        assert_eq!(body["error"], "Rate limit exceeded");
        assert_eq!(body["retry_after"], 1.0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let (gate, clock) = gate();
        assert!(gate.check("login", "bob", 1).allowed());
        clock.advance(Duration::from_millis(2_500));

        let response = gate.check("login", "bob", 1);
        assert!(!response.allowed());
        assert_eq!(response.decision.retry_after, Duration::from_millis(27_500));
        assert_eq!(response.retry_after_secs(), 28);
    }

    #[test]
    fn test_policies_are_isolated() {
        let (gate, _clock) = gate();
        assert!(gate.check("login", "carol", 1).allowed());
        assert!(!gate.check("login", "carol", 1).allowed());
        assert!(gate.check("api", "carol", 1).allowed());

        gate.reset("login", "carol");
        assert!(gate.check("login", "carol", 1).allowed());
    }

    #[test]
    fn test_stats_and_cleanup() {
        let (gate, clock) = gate();
        gate.check("api", "a", 1);
        gate.check("login", "a", 1);
        gate.check("login", "a", 1);

        let stats = gate.stats();
        assert_eq!(stats["default"].admitted, 1);
        assert_eq!(stats["login"].admitted, 1);
        assert_eq!(stats["login"].rejected, 1);

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(gate.cleanup_expired(Duration::from_secs(60)), 2);
    }

    #[test]
    fn test_gate_refuses_policy_named_default() {
        let mut policies = PolicySet::new();
        policies.policies.insert(
            DEFAULT_POLICY.to_string(),
            crate::ratelimit::LimiterPolicy::SlidingWindow {
                limit: 1,
                window_secs: 10.0,
            },
        );
        let clock = ManualClock::new(Duration::from_secs(100));
        assert!(AdmissionGate::from_policies(&policies, Arc::new(clock), None).is_err());
    }
}
