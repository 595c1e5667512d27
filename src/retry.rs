//! Retry/backoff executor
//!
//! Wraps fallible async operations with bounded retries. Errors are sorted
//! into [`RetryClass`]es through the [`Classify`] trait: rate-limit errors
//! wait for the server-reported reset, transient errors back off
//! exponentially with jitter, everything else fails immediately. Both the
//! operation itself and the waits between attempts race a
//! [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Symmetric jitter applied to exponential backoff delays (±25%).
pub const JITTER_RATIO: f64 = 0.25;

/// How the executor should react to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Quota exhausted; wait for the reset time when the server reports one.
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// Timeouts, dropped connections, 5xx responses.
    Transient,
    /// Not worth retrying.
    Terminal,
}

/// Implemented by error types the executor can retry.
pub trait Classify {
    fn classify(&self) -> RetryClass;
}

/// Failure after the executor gave up.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{source} (gave up after {attempts} attempts)")]
    Exhausted { attempts: u32, source: E },

    #[error("{source}")]
    NonRetryable { attempts: u32, source: E },

    #[error("cancelled during attempt {attempts}")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// The error from the final attempt, if the run was not cancelled
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::NonRetryable { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Retry tuning, usually built from the `[retry]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for exponential backoff
    pub max_delay: Duration,
    /// Growth factor between consecutive retries
    pub backoff_multiplier: f64,
    /// Whether rate-limit errors are retried at all
    pub retry_on_rate_limit: bool,
    /// Added on top of the server-reported reset time
    pub rate_limit_buffer: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retry_on_rate_limit: true,
            rate_limit_buffer: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`. No jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Wait until `reset_at` plus the buffer. Without a reset time the
    /// regular backoff is used instead.
    pub fn rate_limit_delay(
        &self,
        reset_at: Option<DateTime<Utc>>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Duration {
        let base = match reset_at {
            Some(reset) => (reset - now).to_std().unwrap_or(Duration::ZERO),
            None => self.backoff_delay(attempt),
        };
        base.saturating_add(self.rate_limit_buffer)
    }
}

/// Scale `delay` by `1 + JITTER_RATIO * factor`, with `factor` clamped to [-1, 1].
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(-1.0, 1.0);
    delay.mul_f64(1.0 + JITTER_RATIO * factor)
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails terminally, exhausts
    /// `max_retries + 1` attempts, or the token is cancelled.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempts);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retry = attempts - 1;
            let delay = match err.classify() {
                RetryClass::Terminal => {
                    return Err(RetryError::NonRetryable {
                        attempts,
                        source: err,
                    })
                }
                RetryClass::RateLimited { .. } if !self.policy.retry_on_rate_limit => {
                    return Err(RetryError::NonRetryable {
                        attempts,
                        source: err,
                    })
                }
                _ if retry >= self.policy.max_retries => {
                    return Err(RetryError::Exhausted {
                        attempts,
                        source: err,
                    })
                }
                RetryClass::RateLimited { reset_at } => {
                    self.policy.rate_limit_delay(reset_at, retry, Utc::now())
                }
                RetryClass::Transient => {
                    let factor: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                    apply_jitter(self.policy.backoff_delay(retry), factor)
                }
            };

            warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:.1}s",
                operation,
                attempts,
                self.policy.max_retries.saturating_add(1),
                err,
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
