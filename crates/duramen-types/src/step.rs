//! Step-level records and configuration: attempts, completions, retry
//! policy, and the per-step options accepted by the step runtime.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Attempt / completion records
// ---------------------------------------------------------------------------

/// One allocated execution attempt for a `(workflow_id, step_id)` pair.
/// `attempt_id` is 1-based and increments when a prior attempt failed or
/// its lease expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub workflow_id: String,
    pub step_id: String,
    pub attempt_id: u32,
    pub started_at: DateTime<Utc>,
    pub fencing_token: u64,
}

/// The unique, final completion record for a `(workflow_id, step_id)`
/// pair. Presence means the step has been durably committed; its recorded
/// result is authoritative on any replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub workflow_id: String,
    pub step_id: String,
    pub attempt_id: u32,
    pub completed_at: DateTime<Utc>,
    /// Opaque reference to the recorded result; the engine stores the id of
    /// the committing `step_completed` event here.
    pub result_ref: String,
    /// Checksum of the workflow state after the step.
    pub result_checksum: String,
    pub org_id: String,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry configuration for a step (or a workflow-wide default).
///
/// `max_attempts` counts the total number of attempts including the first:
/// with `max_attempts = 3`, attempts 1 and 2 may be retried and attempt 3
/// is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Upper bound on a single backoff delay, in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: f64,
    /// Jitter fraction in `[0, 1]`: the delay is scaled by a random factor
    /// in `[1 - jitter, 1]`.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    /// Error kinds eligible for retry. Empty means every kind is
    /// retryable.
    #[serde(default)]
    pub retryable_error_kinds: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_max() -> f64 {
    60.0
}

fn default_backoff_jitter() -> f64 {
    0.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            backoff_jitter: default_backoff_jitter(),
            retryable_error_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is permitted after attempt `attempt_id`
    /// failed with `error_kind`.
    pub fn should_retry(&self, attempt_id: u32, error_kind: &str) -> bool {
        attempt_id < self.max_attempts && self.is_retryable(error_kind)
    }

    /// Whether `error_kind` is in the retryable set.
    pub fn is_retryable(&self, error_kind: &str) -> bool {
        self.retryable_error_kinds.is_empty()
            || self
                .retryable_error_kinds
                .iter()
                .any(|k| k == error_kind)
    }

    /// Backoff delay after attempt `attempt_id`, given a uniform random
    /// sample in `[0, 1)` supplied by the caller. Exponential in the
    /// attempt number, capped at `backoff_max`, scaled into
    /// `[1 - jitter, 1]` of the nominal delay.
    pub fn backoff_delay(&self, attempt_id: u32, unit_sample: f64) -> Duration {
        let nominal = self
            .backoff_base
            .powi(attempt_id as i32)
            .min(self.backoff_max);
        let factor = (1.0 - self.backoff_jitter) + self.backoff_jitter * unit_sample;
        Duration::from_secs_f64((nominal * factor).max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Step options
// ---------------------------------------------------------------------------

/// Per-step configuration accepted by the step runtime.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Opt-out hint for the engine's snapshot cadence: `false` suppresses
    /// the periodic snapshot that would otherwise be taken after this step.
    pub checkpoint: bool,
    /// Wall-clock bound on a single execution attempt.
    pub timeout: Option<Duration>,
    /// Retry policy override for this step.
    pub retry: Option<RetryPolicy>,
    /// Create a rich savepoint (and its backing snapshot) after this step.
    pub savepoint: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            checkpoint: true,
            timeout: None,
            retry: None,
            savepoint: false,
        }
    }
}

impl StepOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_savepoint(mut self) -> Self {
        self.savepoint = true;
        self
    }

    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Step failure
// ---------------------------------------------------------------------------

/// Error returned by a user step function. The `kind` is matched against
/// the retry policy's `retryable_error_kinds`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Error kind the runtime records when a step attempt exceeds its timeout.
pub const TIMEOUT_ERROR_KIND: &str = "timeout";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_attempts_counts_the_first() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, "connection"));
        assert!(policy.should_retry(2, "connection"));
        assert!(!policy.should_retry(3, "connection"));
        assert!(!policy.should_retry(4, "connection"));
    }

    #[test]
    fn test_retryable_kinds_filter() {
        let policy = RetryPolicy {
            retryable_error_kinds: vec!["connection".to_string(), "rate_limit".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(1, "connection"));
        assert!(!policy.should_retry(1, "schema"));
    }

    #[test]
    fn test_empty_retryable_set_means_all() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable("anything"));
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let policy = RetryPolicy {
            backoff_base: 2.0,
            backoff_max: 10.0,
            backoff_jitter: 0.5,
            ..RetryPolicy::default()
        };
        // 2^5 = 32 is capped at 10; jitter sample 0 scales to the floor.
        assert_eq!(
            policy.backoff_delay(5, 0.0),
            Duration::from_secs_f64(5.0)
        );
        assert_eq!(
            policy.backoff_delay(5, 1.0),
            Duration::from_secs_f64(10.0)
        );
        // Below the cap: 2^2 = 4.
        assert_eq!(
            policy.backoff_delay(2, 1.0),
            Duration::from_secs_f64(4.0)
        );
    }

    #[test]
    fn test_retry_policy_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base, 2.0);
        assert_eq!(policy.backoff_max, 60.0);
        assert!(policy.retryable_error_kinds.is_empty());
    }

    #[test]
    fn test_step_options_builders() {
        let opts = StepOptions::default()
            .with_timeout(Duration::from_secs(5))
            .with_savepoint()
            .without_checkpoint();
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert!(opts.savepoint);
        assert!(!opts.checkpoint);
        assert!(StepOptions::default().checkpoint);
    }

    #[test]
    fn test_step_failure_display() {
        let failure = StepFailure::new("connection", "reset by peer");
        assert_eq!(failure.to_string(), "connection: reset by peer");
    }
}
