use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff shared by every remote mutation and by download retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the computed delay (0.2 means ±20%).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// Errors that know whether another attempt can help.
pub trait RetryClass {
    fn is_retryable(&self) -> bool;

    /// Minimum wait requested by the remote side, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Delay before retry number `attempt` (1-based: the wait after the first failure is attempt 1).
///
/// `unit_sample` is a uniform draw in `[0, 1)`; the jitter scales the capped delay by
/// `1 + jitter * (2 * unit_sample - 1)`. A server-provided `retry_after` is a floor.
pub fn compute_backoff_delay(
    policy: &BackoffPolicy,
    attempt: u32,
    unit_sample: f64,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1).min(30)).unwrap_or(30);
    let raw_secs = policy.base_delay.as_secs_f64() * policy.multiplier.max(1.0).powi(exponent);
    let capped_secs = raw_secs.min(policy.max_delay.as_secs_f64());

    let jitter = policy.jitter.clamp(0.0, 1.0);
    let factor = 1.0 + jitter * (2.0 * unit_sample.clamp(0.0, 1.0) - 1.0);
    let jittered = Duration::from_secs_f64((capped_secs * factor).max(0.0));

    match retry_after {
        Some(floor) => {
            let scaled_floor = floor.mul_f64(1.0 + jitter * (2.0 * unit_sample - 1.0).abs());
            jittered.max(scaled_floor)
        }
        None => jittered,
    }
}

/// Terminal state returned by `run_with_retry`.
#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
    pub exhausted_retryable: bool,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or exhausts the policy.
///
/// Returns the value and the attempt count that produced it.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<(T, u32), RetryTerminal<E>>
where
    E: RetryClass,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };
        let retryable = error.is_retryable();
        if !retryable || attempt >= max_attempts {
            return Err(RetryTerminal {
                error,
                attempts: attempt,
                exhausted_retryable: retryable,
            });
        }
        let delay = compute_backoff_delay(
            policy,
            attempt,
            rand::thread_rng().gen::<f64>(),
            error.retry_after(),
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}
