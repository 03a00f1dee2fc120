//! # Retry Module
//!
//! Exponential backoff for broker calls that fail transiently.
//!
//! [`RetryPolicy`] computes delays; [`retry_transient`] drives one broker call
//! through a policy and reports why it gave up. Permanent and cancelled
//! errors are never retried.

use crate::error::BrokerError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delays are spread by up to this fraction in either direction
const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff settings
///
/// # Examples
///
/// ```rust
/// use queue_relay::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(2), 2.0)
///     .without_jitter();
///
/// assert_eq!(policy.backoff(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,

    pub initial_delay: Duration,

    /// Upper bound for every delay, broker hints included
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(16), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based): `initial * multiplier^attempt`,
    /// capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if !self.use_jitter || secs <= 0.0 {
            return Duration::from_secs_f64(secs);
        }

        let spread = secs * JITTER_FRACTION;
        let jittered = secs + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Backoff for `attempt`, raised to the broker's retry hint when that is longer.
    ///
    /// The result never exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &BrokerError) -> Duration {
        let delay = self.backoff(attempt);
        match error.retry_after() {
            Some(hint) if hint > delay => hint.min(self.max_delay),
            _ => delay,
        }
    }
}

/// Why [`retry_transient`] gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    /// Not retried: the error was not transient
    Permanent(BrokerError),

    Exhausted {
        /// Calls made, the first one included
        attempts: u32,
        last_error: BrokerError,
    },
}

impl RetryFailure {
    pub fn into_error(self) -> BrokerError {
        match self {
            Self::Permanent(error) => error,
            Self::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or the policy runs out
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut retries = 0;

    loop {
        let error = match call().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => return Err(RetryFailure::Permanent(error)),
            Err(error) => error,
        };

        if retries >= policy.max_attempts {
            return Err(RetryFailure::Exhausted {
                attempts: retries + 1,
                last_error: error,
            });
        }

        let delay = policy.delay_for(retries, &error);
        warn!(
            operation,
            attempt = retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient broker failure, retrying"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
