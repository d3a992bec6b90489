//! Retry policy and the pure retry decision.
//!
//! The decision is a function of the error, the attempt number, and the
//! policy alone. Delay computation is exponential backoff with an optional
//! cap and jitter; jittered delays are rounded to whole seconds with a
//! floor of one second so a scheduled retry is never immediate.

use crate::error::ErrorObject;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How much randomness to apply to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Jitter {
    /// Use the computed delay exactly
    #[default]
    #[serde(rename = "NONE")]
    None,
    /// Half the computed delay plus a random half
    #[serde(rename = "HALF")]
    Half,
    /// Uniformly random between zero and the computed delay
    #[serde(rename = "FULL")]
    Full,
}

/// Matches error messages for retryability.
#[derive(Debug, Clone)]
pub enum ErrorMatcher {
    /// Case-sensitive substring match on the error message
    Substring(String),
    /// Regular-expression match on the error message
    Pattern(Regex),
}

impl ErrorMatcher {
    fn matches(&self, message: &str) -> bool {
        match self {
            Self::Substring(needle) => message.contains(needle.as_str()),
            Self::Pattern(re) => re.is_match(message),
        }
    }
}

/// Retry configuration for a step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3)
    pub max_attempts: u32,
    /// Delay before the second attempt (default 5s)
    pub initial_delay_seconds: f64,
    /// Multiplier applied per subsequent attempt (default 2)
    pub backoff_rate: f64,
    /// Cap on the computed delay; unbounded when None
    pub max_delay_seconds: Option<f64>,
    /// Jitter mode (default NONE)
    pub jitter: Jitter,
    /// Message matchers consulted for retryability
    pub retryable_matchers: Vec<ErrorMatcher>,
    /// Error types considered retryable
    pub retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_seconds: 5.0,
            backoff_rate: 2.0,
            max_delay_seconds: None,
            jitter: Jitter::None,
            retryable_matchers: Vec::new(),
            retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay_seconds(mut self, seconds: f64) -> Self {
        self.initial_delay_seconds = seconds;
        self
    }

    pub fn with_backoff_rate(mut self, rate: f64) -> Self {
        self.backoff_rate = rate;
        self
    }

    pub fn with_max_delay_seconds(mut self, seconds: f64) -> Self {
        self.max_delay_seconds = Some(seconds);
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on_substring(mut self, needle: impl Into<String>) -> Self {
        self.retryable_matchers
            .push(ErrorMatcher::Substring(needle.into()));
        self
    }

    pub fn retry_on_pattern(mut self, pattern: Regex) -> Self {
        self.retryable_matchers.push(ErrorMatcher::Pattern(pattern));
        self
    }

    pub fn retry_on_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.retryable_error_types.push(error_type.into());
        self
    }

    /// Whether the given error is retryable under this policy.
    ///
    /// With no matchers and no error types configured every error is
    /// retryable. With only one of the two configured, only it is
    /// consulted. With both, either match suffices.
    fn is_retryable(&self, error: &ErrorObject) -> bool {
        let matchers_configured = !self.retryable_matchers.is_empty();
        let types_configured = !self.retryable_error_types.is_empty();
        if !matchers_configured && !types_configured {
            return true;
        }
        let message_matches = matchers_configured
            && self
                .retryable_matchers
                .iter()
                .any(|m| m.matches(&error.error_message));
        let type_matches = types_configured
            && self
                .retryable_error_types
                .iter()
                .any(|t| t == &error.error_type);
        message_matches || type_matches
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and surface the error
    Stop,
    /// Schedule the next attempt after the given delay
    Retry {
        /// Whole-second backoff before the next attempt
        delay_seconds: u64,
    },
}

/// Decides whether the `attempt`-th attempt (1-based) that failed with
/// `error` should be retried.
pub fn decide(error: &ErrorObject, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
    decide_with(error, attempt, policy, &mut rand::thread_rng())
}

/// Same as [`decide`] with an explicit random source, for deterministic
/// testing of jittered delays.
pub fn decide_with<R: Rng>(
    error: &ErrorObject,
    attempt: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> RetryDecision {
    if attempt >= policy.max_attempts {
        return RetryDecision::Stop;
    }
    if !policy.is_retryable(error) {
        return RetryDecision::Stop;
    }

    let exponent = attempt.saturating_sub(1);
    let mut delay = policy.initial_delay_seconds * policy.backoff_rate.powi(exponent as i32);
    if let Some(max) = policy.max_delay_seconds {
        delay = delay.min(max);
    }

    let jittered = match policy.jitter {
        Jitter::None => delay,
        Jitter::Half => delay / 2.0 + rng.gen_range(0.0..=delay / 2.0),
        Jitter::Full => rng.gen_range(0.0..=delay),
    };

    let seconds = jittered.round().max(1.0) as u64;
    RetryDecision::Retry {
        delay_seconds: seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn err(error_type: &str, message: &str) -> ErrorObject {
        ErrorObject::new(error_type, message)
    }

    #[test]
    fn test_default_policy_first_failure() {
        let policy = RetryPolicy::default();
        let decision = decide(&err("E", "boom"), 1, &policy);
        assert_eq!(decision, RetryDecision::Retry { delay_seconds: 5 });
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default().with_max_attempts(10);
        assert_eq!(
            decide(&err("E", "boom"), 2, &policy),
            RetryDecision::Retry { delay_seconds: 10 }
        );
        assert_eq!(
            decide(&err("E", "boom"), 3, &policy),
            RetryDecision::Retry { delay_seconds: 20 }
        );
    }

    #[test]
    fn test_max_attempts_stops() {
        let policy = RetryPolicy::default();
        assert_eq!(decide(&err("E", "boom"), 3, &policy), RetryDecision::Stop);
        assert_eq!(decide(&err("E", "boom"), 4, &policy), RetryDecision::Stop);
    }

    #[test]
    fn test_max_delay_caps() {
        let policy = RetryPolicy::default()
            .with_max_attempts(20)
            .with_max_delay_seconds(30.0);
        assert_eq!(
            decide(&err("E", "boom"), 10, &policy),
            RetryDecision::Retry { delay_seconds: 30 }
        );
    }

    #[test]
    fn test_no_matchers_is_permissive() {
        let policy = RetryPolicy::default();
        assert_ne!(
            decide(&err("Anything", "whatever"), 1, &policy),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_substring_matcher_only() {
        let policy = RetryPolicy::default().retry_on_substring("timeout");
        assert_eq!(
            decide(&err("E", "connection timeout"), 1, &policy),
            RetryDecision::Retry { delay_seconds: 5 }
        );
        assert_eq!(
            decide(&err("E", "access denied"), 1, &policy),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_pattern_matcher() {
        let policy =
            RetryPolicy::default().retry_on_pattern(Regex::new(r"(?i)throttl").unwrap());
        assert_ne!(
            decide(&err("E", "Request Throttled"), 1, &policy),
            RetryDecision::Stop
        );
        assert_eq!(decide(&err("E", "bad input"), 1, &policy), RetryDecision::Stop);
    }

    #[test]
    fn test_error_type_list_only() {
        let policy = RetryPolicy::default().retry_on_error_type("TransientError");
        assert_ne!(
            decide(&err("TransientError", "anything"), 1, &policy),
            RetryDecision::Stop
        );
        assert_eq!(
            decide(&err("FatalError", "anything"), 1, &policy),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_both_configured_either_suffices() {
        let policy = RetryPolicy::default()
            .retry_on_substring("timeout")
            .retry_on_error_type("TransientError");
        assert_ne!(
            decide(&err("Other", "a timeout happened"), 1, &policy),
            RetryDecision::Stop
        );
        assert_ne!(
            decide(&err("TransientError", "no keyword"), 1, &policy),
            RetryDecision::Stop
        );
        assert_eq!(
            decide(&err("Other", "no keyword"), 1, &policy),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_delay_floor_is_one_second() {
        let policy = RetryPolicy::default()
            .with_initial_delay_seconds(0.1)
            .with_jitter(Jitter::Full)
            .with_max_attempts(5);
        for _ in 0..100 {
            match decide(&err("E", "boom"), 1, &policy) {
                RetryDecision::Retry { delay_seconds } => assert!(delay_seconds >= 1),
                RetryDecision::Stop => panic!("expected retry"),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_full_jitter_within_bounds(seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let policy = RetryPolicy::default()
                .with_initial_delay_seconds(10.0)
                .with_jitter(Jitter::Full)
                .with_max_attempts(5);
            match decide_with(&err("E", "boom"), 1, &policy, &mut rng) {
                RetryDecision::Retry { delay_seconds } => {
                    prop_assert!((1..=10).contains(&delay_seconds));
                }
                RetryDecision::Stop => prop_assert!(false, "expected retry"),
            }
        }

        #[test]
        fn prop_half_jitter_lower_bound(seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let policy = RetryPolicy::default()
                .with_initial_delay_seconds(10.0)
                .with_jitter(Jitter::Half)
                .with_max_attempts(5);
            match decide_with(&err("E", "boom"), 1, &policy, &mut rng) {
                RetryDecision::Retry { delay_seconds } => {
                    prop_assert!((5..=10).contains(&delay_seconds));
                }
                RetryDecision::Stop => prop_assert!(false, "expected retry"),
            }
        }

        #[test]
        fn prop_decision_deterministic_without_jitter(attempt in 1u32..20) {
            let policy = RetryPolicy::default().with_max_attempts(20);
            let a = decide(&err("E", "boom"), attempt, &policy);
            let b = decide(&err("E", "boom"), attempt, &policy);
            prop_assert_eq!(a, b);
        }
    }
}
