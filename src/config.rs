//! Per-primitive configuration passed by authors.

use crate::duration::Duration;
use crate::retry::RetryPolicy;

/// Configuration for a step.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Retry policy; None falls back to the default policy
    pub retry: Option<RetryPolicy>,
    /// Engine-internal subtype marker
    pub(crate) sub_type: Option<String>,
}

impl StepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Disables retries entirely.
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryPolicy::none());
        self
    }

    pub(crate) fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }
}

/// Configuration for a callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackConfig {
    /// Overall completion deadline
    pub timeout: Option<Duration>,
    /// Heartbeat deadline, refreshed by out-of-band heartbeats
    pub heartbeat_timeout: Option<Duration>,
}

impl CallbackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Configuration for a chained invoke.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvokeConfig {
    /// Completion deadline for the downstream execution
    pub timeout: Option<Duration>,
}

impl InvokeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Configuration for a map over a collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapConfig {
    /// Upper bound on items processed concurrently; None means all at once
    pub max_concurrency: Option<usize>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_config_no_retry() {
        let config = StepConfig::new().no_retry();
        assert_eq!(config.retry.unwrap().max_attempts, 1);
    }

    #[test]
    fn test_callback_config_builders() {
        let config = CallbackConfig::new()
            .with_timeout(Duration::from_minutes(5))
            .with_heartbeat_timeout(Duration::from_seconds(30));
        assert_eq!(config.timeout.unwrap().to_seconds(), 300);
        assert_eq!(config.heartbeat_timeout.unwrap().to_seconds(), 30);
    }

    #[test]
    fn test_map_config() {
        assert!(MapConfig::new().max_concurrency.is_none());
        assert_eq!(
            MapConfig::new().with_max_concurrency(4).max_concurrency,
            Some(4)
        );
    }
}
