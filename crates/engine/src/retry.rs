//! Shared retry/backoff policy for activity invocations.
//!
//! Every activity call (phase syncs, validation, signal handlers) goes
//! through [`with_retry`]: bounded exponential backoff up to a maximum
//! attempt count, a start-to-close timeout per attempt, and a hard exclusion
//! for error kinds where retrying cannot change the outcome.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use orgsync_core::{SyncError, SyncResult};

/// Bounded exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplicative backoff coefficient.
    pub backoff_coefficient: f64,
    /// Ceiling for any single backoff interval.
    pub max_interval: Duration,
    /// Total attempts (first try included) before the call is permanently
    /// failed and escalated to the dead-letter path.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Policy that fails permanently on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Backoff before the retry following attempt number `attempt`
    /// (1-indexed): `initial * coefficient^(attempt - 1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let initial = self.initial_interval.as_secs_f64();
        let cap = self.max_interval.as_secs_f64();
        let exp = self
            .backoff_coefficient
            .powi(attempt.saturating_sub(1).min(63) as i32);
        Duration::from_secs_f64((initial * exp).min(cap))
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Per-call execution options: retry policy plus start-to-close timeout.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub retry: RetryPolicy,
    /// Start-to-close timeout applied to each individual attempt. Exceeding
    /// it counts as a transient failure subject to the retry policy.
    pub start_to_close: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            start_to_close: Duration::from_secs(5 * 60),
        }
    }
}

impl ActivityOptions {
    pub fn new(retry: RetryPolicy, start_to_close: Duration) -> Self {
        Self {
            retry,
            start_to_close,
        }
    }
}

/// Drive an activity call under the shared policy.
///
/// Validation and not-found errors are surfaced immediately; transient errors
/// are retried with backoff until the attempt budget is exhausted, at which
/// point the last error is returned for the caller to escalate.
pub async fn with_retry<T, F, Fut>(
    options: &ActivityOptions,
    activity: &str,
    mut call: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempts_made = 0u32;

    loop {
        attempts_made += 1;

        let outcome = match tokio::time::timeout(options.start_to_close, call()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                activity: activity.to_string(),
                elapsed_ms: options.start_to_close.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => {
                if attempts_made > 1 {
                    debug!(activity, attempts = attempts_made, "activity succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                warn!(activity, error = %err, "activity failed with non-retryable error");
                return Err(err);
            }
            Err(err) if !options.retry.should_retry(attempts_made) => {
                warn!(
                    activity,
                    attempts = attempts_made,
                    error = %err,
                    "activity permanently failed, attempts exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = options.retry.delay_for_attempt(attempts_made);
                warn!(
                    activity,
                    attempt = attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "activity failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
