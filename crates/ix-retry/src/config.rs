//! Retry coordinator configuration

use std::time::Duration;

use crate::error::RetryError;
use crate::Result;

/// Tuning knobs for queuing, backoff, outage detection and draining
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Capacity of each destination's retry queue
    pub max_queue_size_per_destination: usize,
    /// Consecutive failures at which the backend is probed for an outage
    pub consecutive_failures_before_check: u32,
    /// Drain loop sleep while the backend is considered up
    pub drain_interval_normal: Duration,
    /// Drain loop sleep while in outage mode
    pub drain_interval_outage: Duration,
    /// Attempts per bulk push outside outage mode
    pub bulk_retry_attempts: u32,
    /// Delay before the second bulk attempt
    pub backoff_base: Duration,
    /// Growth factor between successive bulk attempts
    pub backoff_multiplier: u32,
    /// Minimum gap between outage log lines
    pub outage_log_throttle: Duration,
    /// Documents pulled per destination per drain cycle
    pub drain_batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_queue_size_per_destination: 10_000,
            consecutive_failures_before_check: 3,
            drain_interval_normal: Duration::from_secs(5),
            drain_interval_outage: Duration::from_secs(30),
            bulk_retry_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            backoff_multiplier: 2,
            outage_log_throttle: Duration::from_secs(30),
            drain_batch_size: 100,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size_per_destination == 0 {
            return Err(RetryError::InvalidConfig(
                "max_queue_size_per_destination must be greater than 0".to_string(),
            ));
        }
        if self.consecutive_failures_before_check == 0 {
            return Err(RetryError::InvalidConfig(
                "consecutive_failures_before_check must be greater than 0".to_string(),
            ));
        }
        if self.bulk_retry_attempts == 0 {
            return Err(RetryError::InvalidConfig(
                "bulk_retry_attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff_multiplier == 0 {
            return Err(RetryError::InvalidConfig(
                "backoff_multiplier must be greater than 0".to_string(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(RetryError::InvalidConfig(
                "drain_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep after failed bulk attempt `attempt` (1-based): base * multiplier^(attempt - 1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }

    pub fn drain_interval(&self, outage: bool) -> Duration {
        if outage {
            self.drain_interval_outage
        } else {
            self.drain_interval_normal
        }
    }
}
