//! Engine configuration. All fields have working defaults; validation runs
//! synchronously at workflow start.

use std::time::Duration;

use duramen_types::step::RetryPolicy;

use crate::error::EngineError;

/// Tuning knobs for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease duration granted on acquire and on each heartbeat renewal.
    pub lease_ttl: Duration,
    /// Snapshot cadence: a snapshot is written after every this-many
    /// completed steps (and always after a step that creates a savepoint).
    pub snapshot_interval: u64,
    /// Default retry policy for steps that do not override it.
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            snapshot_interval: 5,
            default_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Heartbeat cadence: a third of the lease TTL, so two renewals can be
    /// missed before the lease expires.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    /// Validate the configuration, including a retry policy override from
    /// start options if supplied.
    pub fn validate(&self, retry_override: Option<&RetryPolicy>) -> Result<(), EngineError> {
        if self.lease_ttl.is_zero() {
            return Err(EngineError::Config("lease_ttl must be positive".to_string()));
        }
        if self.snapshot_interval == 0 {
            return Err(EngineError::Config(
                "snapshot_interval must be at least 1".to_string(),
            ));
        }
        let retry = retry_override.unwrap_or(&self.default_retry);
        if retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.backoff_base < 0.0 || retry.backoff_max < 0.0 {
            return Err(EngineError::Config(
                "retry backoff must be non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.backoff_jitter) {
            return Err(EngineError::Config(
                "retry backoff_jitter must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}
