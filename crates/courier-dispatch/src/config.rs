//! Dispatch core configuration.

use std::time::Duration;

use crate::error::DispatchError;

/// Tuning knobs for the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of concurrent publish workers.
    pub worker_count: usize,
    /// How often the scheduler looks for due posts.
    pub scheduler_tick: Duration,
    /// How often the retry promoter wakes.
    pub retry_tick: Duration,
    /// In-flight attempts untouched for this long are reaped.
    pub lease_timeout: Duration,
    /// Posts older than this when first seen are left for an operator.
    pub catch_up_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Retry budget per platform attempt.
    pub max_attempts: u32,
    /// Upper bound on one adapter publish call.
    pub publish_timeout: Duration,
    /// Refresh tokens expiring within this window.
    pub credential_skew: Duration,
    pub dispatch_queue_capacity: usize,
    /// Per-subscriber event buffer before the oldest events are dropped.
    pub subscriber_buffer: usize,
    /// How long a worker blocks on the dispatch queue before rechecking shutdown.
    pub take_timeout: Duration,
    /// Maximum posts examined per scheduler tick.
    pub scheduler_batch: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            scheduler_tick: Duration::from_secs(30),
            retry_tick: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(60),
            catch_up_grace: Duration::from_secs(5 * 60),
            backoff_base: Duration::from_secs(60),
            backoff_ceiling: Duration::from_secs(900),
            max_attempts: 3,
            publish_timeout: Duration::from_secs(30),
            credential_skew: Duration::from_secs(5 * 60),
            dispatch_queue_capacity: 1024,
            subscriber_buffer: 64,
            take_timeout: Duration::from_secs(10),
            scheduler_batch: 500,
        }
    }
}

impl DispatchConfig {
    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let positive = [
            ("worker_count", self.worker_count),
            ("dispatch_queue_capacity", self.dispatch_queue_capacity),
            ("subscriber_buffer", self.subscriber_buffer),
            ("scheduler_batch", self.scheduler_batch),
            ("max_attempts", self.max_attempts as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DispatchError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        let durations = [
            ("scheduler_tick", self.scheduler_tick),
            ("retry_tick", self.retry_tick),
            ("lease_timeout", self.lease_timeout),
            ("publish_timeout", self.publish_timeout),
            ("take_timeout", self.take_timeout),
            ("backoff_base", self.backoff_base),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(DispatchError::InvalidConfig(format!(
                    "{} must be non-zero",
                    name
                )));
            }
        }

        if self.backoff_ceiling < self.backoff_base {
            return Err(DispatchError::InvalidConfig(
                "backoff_ceiling must not be below backoff_base".to_string(),
            ));
        }
        if self.lease_timeout <= self.publish_timeout {
            return Err(DispatchError::InvalidConfig(
                "lease_timeout must exceed publish_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.scheduler_tick, Duration::from_secs(30));
        assert_eq!(config.retry_tick, Duration::from_secs(60));
        assert_eq!(config.lease_timeout, Duration::from_secs(60));
        assert_eq!(config.catch_up_grace, Duration::from_secs(300));
        assert_eq!(config.backoff_base, Duration::from_secs(60));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(900));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.publish_timeout, Duration::from_secs(30));
        assert_eq!(config.credential_skew, Duration::from_secs(300));
        assert_eq!(config.dispatch_queue_capacity, 1024);
        assert_eq!(config.subscriber_buffer, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = DispatchConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DispatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_lease_shorter_than_publish() {
        let config = DispatchConfig {
            lease_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
