//! Retry with exponential backoff, per-call deadlines and cancellation.
//!
//! Every remote call in the pipeline (provider pages, token refreshes,
//! enrichment lookups) goes through [`retry`]. Errors say how they should be
//! treated through [`Retryable::retry_class`] instead of being matched on
//! their text.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::duration_millis;

/// How a failed call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry with backoff, up to `max_attempts`.
    Transient,
    /// Wait as instructed (or back off) and retry, up to `max_rate_limit_waits`.
    RateLimited(Option<Duration>),
    /// Give up immediately.
    Permanent,
}

/// Errors that can be fed through [`retry`].
pub trait Retryable: Sized + std::fmt::Display {
    /// Classifies the error.
    fn retry_class(&self) -> RetryClass;

    /// Error returned when the run is cancelled mid-call.
    fn cancelled() -> Self;

    /// Error returned when one attempt exceeds its deadline.
    fn timed_out(after: Duration) -> Self;
}

/// Retry bounds shared by providers and enrichment sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "duration_millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    #[serde(with = "duration_millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Spread delays by up to 10% either way.
    pub jitter: bool,
    /// Rate-limit waits tolerated per call, on top of `max_attempts`.
    pub max_rate_limit_waits: u32,
    /// Longest retry-after instruction that is honored; longer ones fail the call.
    #[serde(with = "duration_millis", rename = "max_retry_after_ms")]
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            max_rate_limit_waits: 5,
            max_retry_after: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        if self.jitter { add_jitter(delay) } else { delay }
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let spread = delay.as_secs_f64() * 0.1;
    if spread <= 0.0 {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

/// Everything a remote call needs besides its arguments.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Retry bounds.
    pub policy: RetryPolicy,
    /// Deadline per attempt.
    pub timeout: Duration,
    /// Run-wide cancellation.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Creates a context.
    #[must_use]
    pub const fn new(policy: RetryPolicy, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            policy,
            timeout,
            cancel,
        }
    }

    /// Runs `operation` under this context. See [`retry`].
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted or the error is permanent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, operation: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        retry(&self.policy, self.timeout, &self.cancel, label, operation).await
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of attempts.
///
/// Each attempt is bounded by `timeout`. Transient failures back off
/// exponentially; rate-limit failures wait for the provider's retry-after
/// instruction when given. Cancellation interrupts both the call and any
/// pending wait.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or the error is permanent,
/// or `E::cancelled()` when `cancel` fires.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    label: &str,
    operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_attempts(policy, Some(timeout), cancel, label, operation).await
}

/// Like [`retry`], but attempts carry no deadline of their own.
///
/// For operations that wait before calling out (admission control) and
/// bound only the call itself with [`with_deadline`].
///
/// # Errors
///
/// Same as [`retry`].
pub async fn retry_unbounded<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_attempts(policy, None, cancel, label, operation).await
}

/// Bounds `call` by `timeout`, mapping expiry to `E::timed_out`.
///
/// # Errors
///
/// Returns the call's error, or `E::timed_out(timeout)`.
pub async fn with_deadline<T, E, Fut>(timeout: Duration, call: Fut) -> Result<T, E>
where
    E: Retryable,
    Fut: Future<Output = Result<T, E>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(E::timed_out(timeout)))
}

async fn retry_attempts<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    let mut rate_limit_waits = 0u32;

    loop {
        attempt += 1;

        let call = async {
            match timeout {
                Some(timeout) => with_deadline(timeout, operation()).await,
                None => operation().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(E::cancelled()),
            result = call => result,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let delay = match error.retry_class() {
            RetryClass::Permanent => return Err(error),
            RetryClass::Transient if attempt < policy.max_attempts => policy.backoff(attempt),
            RetryClass::Transient => return Err(error),
            RetryClass::RateLimited(after) => {
                if rate_limit_waits >= policy.max_rate_limit_waits {
                    return Err(error);
                }
                rate_limit_waits += 1;
                // Throttled attempts do not count against max_attempts.
                attempt -= 1;
                match after {
                    Some(after) if after > policy.max_retry_after => return Err(error),
                    Some(after) => after,
                    None => policy.backoff(rate_limit_waits),
                }
            }
        };

        debug!(
            operation = label,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "retrying"
        );

        if !sleep_or_cancel(delay, cancel).await {
            return Err(E::cancelled());
        }
    }
}

/// Sleeps for `delay` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
