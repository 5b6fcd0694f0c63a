//! Retry, backoff, and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. [`RetryPolicy`] and
//! [`retry_async`] drive bounded retries for one-shot requests, while
//! [`Backoff`] is the stateful reconnect controller used by long-lived
//! streams.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Returns a low-latency default suitable for short-lived API requests.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::low_latency()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    Duration::from_nanos(rand::thread_rng().gen_range(0..=limit_nanos))
}

/// Shape of the reconnect delay curve used by [`Backoff`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound applied before randomization.
    pub max_delay: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    /// Fraction of the delay that is randomized in both directions.
    ///
    /// `0.5` spreads a 1s delay across `[0.5s, 1.5s]`.
    pub randomization_factor: f64,
}

impl BackoffConfig {
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
    pub const DEFAULT_FACTOR: f64 = 4.0;
    pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

    /// Checks that the curve is well formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("max reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("backoff factor must be a finite number >= 1.0".to_string());
        }
        if !self.randomization_factor.is_finite()
            || !(0.0..=1.0).contains(&self.randomization_factor)
        {
            return Err("randomization factor must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Deterministic delay for a 0-based attempt, before randomization.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let base = initial * exponent;
        if !base.is_finite() || base > max {
            return self.max_delay;
        }
        Duration::from_secs_f64(base)
    }

    fn randomize(&self, base: Duration) -> Duration {
        if self.randomization_factor == 0.0 || base.is_zero() {
            return base;
        }

        let spread = self.randomization_factor;
        let scale = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        Duration::from_secs_f64(base.as_secs_f64() * scale)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            factor: Self::DEFAULT_FACTOR,
            randomization_factor: Self::DEFAULT_RANDOMIZATION_FACTOR,
        }
    }
}

/// Stateful reconnect controller with a bounded number of attempts.
///
/// Every [`next_delay`](Backoff::next_delay) call consumes one attempt. Once
/// `max_attempts` consecutive attempts have been handed out without a
/// [`reset`](Backoff::reset), [`has_exceeded_limit`](Backoff::has_exceeded_limit)
/// reports true and callers must stop scheduling reconnects.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig, max_attempts: u32) -> Self {
        Self {
            config,
            max_attempts,
            attempt: 0,
        }
    }

    /// Returns the delay for the next reconnect and advances the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.config.randomize(base)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_exceeded_limit(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
