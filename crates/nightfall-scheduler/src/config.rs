//! Scheduler configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Session-wide retry policy for aborted and failed jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Aborted jobs are eligible again at the next evaluation.
    pub reschedule_aborts_immediate: bool,
    /// Aborted jobs are eligible again after `abort_delay_seconds`.
    pub reschedule_aborts_queue: bool,
    /// Failed jobs are eligible again after `error_delay_seconds`.
    pub reschedule_errors: bool,
    pub abort_delay_seconds: u64,
    pub error_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reschedule_aborts_immediate: false,
            reschedule_aborts_queue: true,
            reschedule_errors: false,
            abort_delay_seconds: 3600,
            error_delay_seconds: 3600,
        }
    }
}

/// Longest simulation horizon accepted, one leap year.
pub const MAX_HORIZON_HOURS: u64 = 366 * 24;

/// Longest retry delay accepted, one hundred years.
pub const MAX_RETRY_DELAY_SECONDS: u64 = 100 * 366 * 24 * 3600;

/// Seconds as a duration, saturating at [`Duration::MAX`].
fn saturating_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

impl RetryPolicy {
    /// Delay before an aborted job is eligible again. Out-of-range values
    /// saturate, so a huge delay never reads as negative.
    pub fn abort_delay(&self) -> Duration {
        saturating_seconds(self.abort_delay_seconds)
    }

    pub fn error_delay(&self) -> Duration {
        saturating_seconds(self.error_delay_seconds)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        let delays = [
            ("abort_delay_seconds", self.abort_delay_seconds),
            ("error_delay_seconds", self.error_delay_seconds),
        ];
        for (name, value) in delays {
            if value > MAX_RETRY_DELAY_SECONDS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} of {value}s exceeds the {MAX_RETRY_DELAY_SECONDS}s limit"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for [`GreedyScheduler`](crate::GreedyScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// Sampling step for constraint checks, in seconds.
    pub resolution_seconds: u64,
    /// How far ahead the simulation looks, in hours.
    pub horizon_hours: u64,
    /// Upper bound on simulated schedule segments.
    pub max_segments: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            resolution_seconds: 60,
            horizon_hours: 72,
            max_segments: 500,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.resolution_seconds == 0 {
            return Err(SchedulerError::InvalidConfig(
                "resolution_seconds must be positive".to_string(),
            ));
        }
        if self.horizon_hours == 0 {
            return Err(SchedulerError::InvalidConfig(
                "horizon_hours must be positive".to_string(),
            ));
        }
        if self.horizon_hours > MAX_HORIZON_HOURS {
            return Err(SchedulerError::InvalidConfig(format!(
                "horizon of {}h exceeds the {MAX_HORIZON_HOURS}h limit",
                self.horizon_hours
            )));
        }
        let horizon_seconds = self.horizon_hours.checked_mul(3600);
        if horizon_seconds.is_none_or(|h| self.resolution_seconds > h) {
            return Err(SchedulerError::InvalidConfig(format!(
                "resolution of {}s exceeds the {}h horizon",
                self.resolution_seconds, self.horizon_hours
            )));
        }
        if self.max_segments == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_segments must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }

    pub fn resolution(&self) -> Duration {
        saturating_seconds(self.resolution_seconds)
    }

    pub fn horizon(&self) -> Duration {
        saturating_seconds(self.horizon_hours.saturating_mul(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let policy = RetryPolicy::default();
        assert!(!policy.reschedule_aborts_immediate);
        assert!(policy.reschedule_aborts_queue);
        assert!(!policy.reschedule_errors);
        assert_eq!(policy.abort_delay(), Duration::hours(1));
        assert_eq!(policy.error_delay(), Duration::hours(1));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_resolution() {
        let config = SchedulerConfig {
            resolution_seconds: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_resolution_beyond_horizon() {
        let config = SchedulerConfig {
            resolution_seconds: 7200,
            horizon_hours: 1,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_horizon_without_overflow() {
        let config = SchedulerConfig {
            horizon_hours: u64::MAX / 100,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));

        let config = SchedulerConfig {
            horizon_hours: MAX_HORIZON_HOURS,
            resolution_seconds: 3600,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.horizon(), Duration::days(366));
    }

    #[test]
    fn test_huge_delays_saturate() {
        let policy = RetryPolicy {
            abort_delay_seconds: u64::MAX,
            error_delay_seconds: 1 << 62,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.abort_delay(), Duration::MAX);
        assert_eq!(policy.error_delay(), Duration::MAX);
        assert!(policy.abort_delay() > Duration::zero());
    }

    #[test]
    fn test_validate_rejects_out_of_range_delay() {
        let config = SchedulerConfig {
            retry: RetryPolicy {
                abort_delay_seconds: MAX_RETRY_DELAY_SECONDS + 1,
                ..RetryPolicy::default()
            },
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{ "reschedule_errors": true, "horizon_hours": 12 }"#).unwrap();
        assert!(config.retry.reschedule_errors);
        assert!(config.retry.reschedule_aborts_queue);
        assert_eq!(config.horizon_hours, 12);
        assert_eq!(config.resolution_seconds, 60);
    }
}
