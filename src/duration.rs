//! Duration helpers for wait and callback timeouts.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A whole-second duration used for waits, timeouts, and retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration(u64);

impl Duration {
    /// Creates a duration from seconds.
    pub fn from_seconds(seconds: u64) -> Self {
        Self(seconds)
    }

    /// Creates a duration from minutes.
    pub fn from_minutes(minutes: u64) -> Self {
        Self(minutes * 60)
    }

    /// Creates a duration from hours.
    pub fn from_hours(hours: u64) -> Self {
        Self(hours * 3600)
    }

    /// Creates a duration from days.
    pub fn from_days(days: u64) -> Self {
        Self(days * 86400)
    }

    /// Returns the duration in whole seconds.
    pub fn to_seconds(&self) -> u64 {
        self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self(d.as_secs())
    }
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        assert_eq!(Duration::from_seconds(30).to_seconds(), 30);
        assert_eq!(Duration::from_minutes(2).to_seconds(), 120);
        assert_eq!(Duration::from_hours(1).to_seconds(), 3600);
        assert_eq!(Duration::from_days(1).to_seconds(), 86400);
    }

    #[test]
    fn test_from_std_duration() {
        let d: Duration = std::time::Duration::from_secs(45).into();
        assert_eq!(d.to_seconds(), 45);
    }

    #[test]
    fn test_epoch_seconds_is_recent() {
        // Any time after 2020-01-01.
        assert!(epoch_seconds() > 1_577_836_800.0);
    }
}
