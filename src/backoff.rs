//! Reconnect backoff policy
//!
//! The delay before reconnect attempt `n` (0-indexed) is
//! `initial × factor^n`, clamped to `max`, then jittered. The base is
//! derived from the attempt number alone, so jitter never compounds.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Randomization applied to a backoff delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Jitter {
    /// Exact delay
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay/2 + uniform[0, delay/2]`
    Equal,
}

impl Jitter {
    /// Apply jitter to `delay`
    pub fn apply(self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=half))
            }
        }
    }
}

/// How a subscription retries after a transport failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (milliseconds)
    pub initial_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    pub max_ms: u64,

    /// Multiplicative growth per consecutive failure
    pub factor: f64,

    #[serde(default)]
    pub jitter: Jitter,

    /// Consecutive failed attempts before giving up; `None` retries forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            factor: 2.0,
            jitter: Jitter::Equal,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_ms);
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = Duration::from_millis(self.initial_ms).as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        };

        self.jitter.apply(base)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |limit| failures < limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(initial_ms: u64, max_ms: u64, factor: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_ms,
            max_ms,
            factor,
            jitter: Jitter::None,
            max_attempts: None,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let policy = exact(100, 30_000, 2.0);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_clamped_to_max() {
        let policy = exact(100, 1_000, 2.0);
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_constant_factor() {
        let policy = exact(250, 30_000, 1.0);
        for attempt in 0..5 {
            assert_eq!(policy.delay(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);
            let equal = Jitter::Equal.apply(delay);
            assert!(equal >= Duration::from_millis(500) && equal <= delay);
        }
        assert_eq!(Jitter::Equal.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_allows() {
        let unbounded = ReconnectPolicy::default();
        assert!(unbounded.allows(u32::MAX - 1));

        let bounded = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(bounded.allows(0));
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = ReconnectPolicy {
            max_attempts: Some(5),
            ..Default::default()
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"initialMs\":500"));
        assert!(json.contains("\"maxAttempts\":5"));
        assert!(json.contains("\"jitter\":\"equal\""));

        let parsed: ReconnectPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
