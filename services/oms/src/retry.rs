//! Retry with backoff around exchange calls
//!
//! Only local-to-exchange routing is retried. Every attempt runs under a
//! deadline; an expired deadline is reported as [`AdapterError::Timeout`]
//! and classified like any other error.

use crate::adapter::AdapterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// `initial * multiplier^(n-1)`
    #[default]
    Exponential,
    /// `initial * n`
    Linear,
}

/// Retry policy for routing calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Delay growth
    pub backoff_type: BackoffType,
    /// Delay before the second attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Delay ceiling (milliseconds)
    pub max_delay_ms: u64,
    /// Exponential growth factor
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_type: BackoffType::Exponential,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let ms = match self.backoff_type {
            BackoffType::Exponential => {
                let exp = i32::try_from(n - 1).unwrap_or(i32::MAX);
                (self.initial_delay_ms as f64 * self.multiplier.powi(exp)).min(self.max_delay_ms as f64) as u64
            }
            BackoffType::Linear => self.initial_delay_ms.saturating_mul(u64::from(n)),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Check bounds
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "initial_delay_ms {} exceeds max_delay_ms {}",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        if self.multiplier < 1.0 {
            return Err(format!("multiplier {} must be >= 1", self.multiplier));
        }
        Ok(())
    }
}

/// Predicate deciding whether an error is worth another attempt
pub type RetryClassifier = Arc<dyn Fn(&AdapterError) -> bool + Send + Sync>;

/// Successful call with its attempt history
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    /// Call result
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Duration of each attempt, in order
    pub timings: Vec<Duration>,
}

/// Call that failed for good
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// Error from the last attempt
    pub error: AdapterError,
    /// Attempts made
    pub attempts: u32,
    /// Duration of each attempt, in order
    pub timings: Vec<Duration>,
}

/// Runs exchange calls under a [`RetryPolicy`] and a per-attempt deadline
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    deadline: Duration,
    classifier: RetryClassifier,
}

impl Retrier {
    /// Retrier using [`AdapterError::is_retryable`]
    #[must_use]
    pub fn new(policy: RetryPolicy, deadline: Duration) -> Self {
        Self {
            policy,
            deadline,
            classifier: Arc::new(AdapterError::is_retryable),
        }
    }

    /// Replace the retryable-error predicate
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl Fn(&AdapterError) -> bool + Send + Sync + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Policy in use
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Per-attempt deadline
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `call` until it succeeds, fails with a non-retryable error or
    /// the attempt budget is spent. `call` receives the 1-based attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut timings = Vec::with_capacity(max_attempts as usize);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.deadline, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(self.deadline)),
            };
            timings.push(started.elapsed());

            let error = match outcome {
                Ok(value) => {
                    debug!("{} succeeded on attempt {}/{}", operation, attempt, max_attempts);
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        timings,
                    });
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || !(self.classifier)(&error) {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    timings,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                operation, attempt, max_attempts, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
