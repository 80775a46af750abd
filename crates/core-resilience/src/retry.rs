//! Retry executor with exponential backoff
//!
//! Re-invokes a failing operation according to a [`RetryPolicy`]. Which
//! failures are retried is decided by their [`ErrorKind`]: kinds in the
//! stop-set are re-raised at once, kinds in the retry-set are retried with
//! `min(max_wait, min_wait * multiplier^(attempt-1))` between attempts, and
//! anything else is re-raised at once as well.
//!
//! # Example
//!
//! ```
//! use taskguard_core_resilience::retry::{RetryExecutor, RetryPolicy};
//! use taskguard_core_resilience::ResilienceError;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let executor = RetryExecutor::new(
//!     RetryPolicy::new()
//!         .with_max_attempts(3)
//!         .with_min_wait(Duration::from_millis(10)),
//! );
//!
//! let value = executor
//!     .execute(|| async { Ok::<_, ResilienceError>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```

use super::error::{Classify, ErrorKind};
use rand::Rng;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Backoff and classification rules for retries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub min_wait: Duration,
    /// Upper bound on any single delay
    pub max_wait: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Random spread applied to each delay, 0.0 disables it (0.1 = ±10%)
    pub jitter: f64,
    /// Failure kinds that are retried
    pub retry_on: BTreeSet<ErrorKind>,
    /// Failure kinds that end the retry loop immediately
    pub stop_on: BTreeSet<ErrorKind>,
    /// Log each failed attempt before sleeping
    pub log_before_sleep: bool,
    /// Log the final failure
    pub log_after_failure: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            retry_on: [
                ErrorKind::Transient,
                ErrorKind::Timeout,
                ErrorKind::RateLimited,
                ErrorKind::Connection,
                ErrorKind::PoolTimeout,
            ]
            .into_iter()
            .collect(),
            stop_on: [
                ErrorKind::Permanent,
                ErrorKind::CircuitOpen,
                ErrorKind::PoolClosed,
                ErrorKind::InvalidInput,
            ]
            .into_iter()
            .collect(),
            log_before_sleep: true,
            log_after_failure: true,
        }
    }
}

impl RetryPolicy {
    /// Default policy: 3 attempts, 1s..10s exponential backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            multiplier: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_min_wait(mut self, wait: Duration) -> Self {
        self.min_wait = wait;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Set the growth factor (at least 1.0, so delays never shrink)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Replace the retry-set
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Replace the stop-set
    pub fn stop_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.stop_on = kinds.into_iter().collect();
        self
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.min_wait.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.clamp(0.0, self.max_wait.as_secs_f64())
        } else {
            self.max_wait.as_secs_f64()
        };

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            (capped + rand::rng().random_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };

        // f64 rounding can land just past Duration::MAX
        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_wait)
    }

    /// What to do with a failure of `kind`
    pub fn decide(&self, kind: ErrorKind) -> RetryDecision {
        if self.stop_on.contains(&kind) {
            RetryDecision::Stop
        } else if self.retry_on.contains(&kind) {
            RetryDecision::Retry
        } else {
            RetryDecision::NotRetryable
        }
    }
}

/// Classification of a single failure under a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Kind is in the retry-set
    Retry,
    /// Kind is in the stop-set
    Stop,
    /// Kind is in neither set
    NotRetryable,
}

/// Failure returned by [`RetryExecutor::execute`]
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retryable error
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted {
        #[source]
        last: E,
        attempts: u32,
    },

    /// A failure that must not be retried ended the loop early
    #[error("operation aborted on attempt {attempts}: {source}")]
    Aborted {
        #[source]
        source: E,
        attempts: u32,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last underlying failure
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { source, .. } => source,
        }
    }

    /// Unwrap into the last underlying failure
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { source, .. } => source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E> Classify for RetryError<E>
where
    E: std::error::Error + Classify + 'static,
{
    fn kind(&self) -> ErrorKind {
        self.last_error().kind()
    }
}

/// Runs operations under a [`RetryPolicy`]
///
/// Stateless apart from the policy, so one executor can be shared freely.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds or the policy gives up
    ///
    /// Arguments for the operation are captured by the closure and handed
    /// unchanged to every attempt.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        self.execute_with_notify(op, |_, _, _| {}).await
    }

    /// Like [`execute`](Self::execute), calling `notify(attempt, error, delay)`
    /// before each backoff sleep
    pub async fn execute_with_notify<F, Fut, T, E, N>(
        &self,
        mut op: F,
        mut notify: N,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
        N: FnMut(u32, &E, Duration),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = err.kind();
            match self.policy.decide(kind) {
                RetryDecision::Stop | RetryDecision::NotRetryable => {
                    if self.policy.log_after_failure {
                        error!(attempt, %kind, error = %err, "operation failed with non-retryable error");
                    }
                    return Err(RetryError::Aborted {
                        source: err,
                        attempts: attempt,
                    });
                }
                RetryDecision::Retry if attempt >= max_attempts => {
                    if self.policy.log_after_failure {
                        error!(attempts = attempt, %kind, error = %err, "retries exhausted");
                    }
                    return Err(RetryError::Exhausted {
                        last: err,
                        attempts: attempt,
                    });
                }
                RetryDecision::Retry => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    if self.policy.log_before_sleep {
                        warn!(
                            attempt,
                            max_attempts,
                            ?delay,
                            %kind,
                            error = %err,
                            "attempt failed, retrying"
                        );
                    }
                    notify(attempt, &err, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts, {:?}..{:?} x{}",
            self.max_attempts, self.min_wait, self.max_wait, self.multiplier
        )
    }
}
