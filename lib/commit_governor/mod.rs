//! Single choke point for every mutation of the shared store.
//!
//! Holds the circuit breaker, the retry/backoff policy and the per-key throttle for
//! non-critical writes, so that this state lives in one injected component instead of being
//! spread across callers.

mod backoff;
mod breaker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock::{duration_ms, SharedClock};
use crate::lease_store::StoreError;
use crate::server::monitoring::GOVERNOR_METRICS;

pub use backoff::{compute_backoff_delay, run_with_retry, BackoffPolicy, RetryClass, RetryTerminal};
pub use breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState};

impl RetryClass for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        StoreError::retry_after(self)
    }
}

/// Critical writes (done markers, lease release) are never short-circuited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    Critical,
    NonCritical,
}

impl WriteClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::NonCritical => "non_critical",
        }
    }
}

/// Describes one governed mutation.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub operation: &'a str,
    pub class: WriteClass,
    /// Non-critical writes sharing a key are spaced by the adaptive throttle interval.
    pub throttle_key: Option<&'a str>,
}

impl<'a> WriteRequest<'a> {
    pub fn critical(operation: &'a str) -> Self {
        Self {
            operation,
            class: WriteClass::Critical,
            throttle_key: None,
        }
    }

    pub fn non_critical(operation: &'a str) -> Self {
        Self {
            operation,
            class: WriteClass::NonCritical,
            throttle_key: None,
        }
    }

    pub fn throttled(mut self, key: &'a str) -> Self {
        self.throttle_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome<T> {
    Applied(T),
    /// Skipped locally: circuit open or throttled. Not an error.
    ShortCircuited,
}

impl<T> CommitOutcome<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::ShortCircuited => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("{class} write `{operation}` failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        class: &'static str,
        attempts: u32,
        #[source]
        last_error: StoreError,
    },
    #[error("write `{operation}` rejected by the store: {source}")]
    Rejected {
        operation: String,
        #[source]
        source: StoreError,
    },
}

impl GovernorError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Rejected { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorConfig {
    pub breaker: BreakerConfig,
    pub backoff: BackoffPolicy,
    /// Base spacing between non-critical writes to the same key; doubles per recent failure.
    pub non_critical_min_interval: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            backoff: BackoffPolicy::default(),
            non_critical_min_interval: Duration::from_secs(5),
        }
    }
}

pub struct CommitGovernor {
    config: GovernorConfig,
    breaker: CircuitBreaker,
    clock: SharedClock,
    rng: Mutex<StdRng>,
    last_write_ms: Mutex<HashMap<String, u64>>,
}

impl CommitGovernor {
    pub fn new(config: GovernorConfig, clock: SharedClock) -> Self {
        Self::with_rng(config, clock, StdRng::from_entropy())
    }

    pub fn with_rng(config: GovernorConfig, clock: SharedClock, rng: StdRng) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.breaker, clock.clone()),
            config,
            clock,
            rng: Mutex::new(rng),
            last_write_ms: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Runs one store mutation under breaker, throttle and retry policy.
    ///
    /// Non-critical writes never fail: they return `ShortCircuited` while the circuit is open,
    /// when throttled, when rejected, or once their retries run out. Critical writes retry until
    /// success or exhaustion; exhaustion is logged at error level and returned.
    pub async fn execute<T, F, Fut>(
        &self,
        request: WriteRequest<'_>,
        mut op: F,
    ) -> Result<CommitOutcome<T>, GovernorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let critical = request.class == WriteClass::Critical;
        let admission = self.breaker.admit(critical);
        if admission == Admission::Rejected {
            debug!(
                event = "governor_short_circuit",
                operation = request.operation,
                "circuit open; skipping non-critical write"
            );
            if let Some(metrics) = GOVERNOR_METRICS.get() {
                metrics.writes_short_circuited_total.inc();
            }
            return Ok(CommitOutcome::ShortCircuited);
        }
        if !critical && admission != Admission::Trial && self.is_throttled(request.throttle_key) {
            if let Some(metrics) = GOVERNOR_METRICS.get() {
                metrics.writes_throttled_total.inc();
            }
            return Ok(CommitOutcome::ShortCircuited);
        }

        let max_attempts = self.config.backoff.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    self.publish_state();
                    if let Some(metrics) = GOVERNOR_METRICS.get() {
                        metrics.writes_applied_total.inc();
                    }
                    return Ok(CommitOutcome::Applied(value));
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                if admission == Admission::Trial {
                    self.breaker.release_trial();
                }
                warn!(
                    event = "governor_write_rejected",
                    operation = request.operation,
                    class = request.class.as_str(),
                    error = %error,
                    "store rejected write"
                );
                if !critical {
                    if let Some(metrics) = GOVERNOR_METRICS.get() {
                        metrics.writes_short_circuited_total.inc();
                    }
                    return Ok(CommitOutcome::ShortCircuited);
                }
                return Err(GovernorError::Rejected {
                    operation: request.operation.to_string(),
                    source: error,
                });
            }

            if self.breaker.record_failure() {
                warn!(
                    event = "circuit_opened",
                    operation = request.operation,
                    error = %error,
                    "remote write failures crossed threshold; circuit opened"
                );
                if let Some(metrics) = GOVERNOR_METRICS.get() {
                    metrics.circuit_opened_total.inc();
                }
            }
            self.publish_state();

            if !critical && self.breaker.state() != CircuitState::Closed {
                return Ok(CommitOutcome::ShortCircuited);
            }

            if attempt >= max_attempts {
                let exhausted = self.exhausted(request, attempt, error);
                if !critical {
                    return Ok(CommitOutcome::ShortCircuited);
                }
                return Err(exhausted);
            }

            let delay = {
                let sample = self
                    .rng
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .gen::<f64>();
                compute_backoff_delay(&self.config.backoff, attempt, sample, error.retry_after())
            };
            debug!(
                event = "governor_retry",
                operation = request.operation,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "retrying remote write"
            );
            if let Some(metrics) = GOVERNOR_METRICS.get() {
                metrics.write_retries_total.inc();
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    /// `execute` for critical writes, unwrapping the outcome.
    pub async fn execute_critical<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
    ) -> Result<T, GovernorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.execute(WriteRequest::critical(operation), op).await? {
            CommitOutcome::Applied(value) => Ok(value),
            // Critical writes bypass admission and never stop early on an open circuit.
            CommitOutcome::ShortCircuited => Err(GovernorError::Rejected {
                operation: operation.to_string(),
                source: StoreError::fatal("governor", "critical write was short-circuited"),
            }),
        }
    }

    /// Retries a store read under the shared backoff policy. Reads do not feed the breaker.
    pub async fn read<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match run_with_retry(&self.config.backoff, |_| op()).await {
            Ok((value, _)) => Ok(value),
            Err(terminal) => {
                warn!(
                    event = "store_read_failed",
                    operation,
                    attempts = terminal.attempts,
                    error = %terminal.error,
                    "store read failed"
                );
                Err(terminal.error)
            }
        }
    }

    fn exhausted(
        &self,
        request: WriteRequest<'_>,
        attempts: u32,
        error: StoreError,
    ) -> GovernorError {
        if request.class == WriteClass::Critical {
            error!(
                event = "critical_write_exhausted",
                operation = request.operation,
                attempts,
                error = %error,
                "critical remote write failed after all retries; completion state may be lost"
            );
            if let Some(metrics) = GOVERNOR_METRICS.get() {
                metrics.critical_writes_exhausted_total.inc();
            }
        } else {
            warn!(
                event = "non_critical_write_exhausted",
                operation = request.operation,
                attempts,
                error = %error,
                "non-critical remote write gave up"
            );
        }
        GovernorError::Exhausted {
            operation: request.operation.to_string(),
            class: request.class.as_str(),
            attempts,
            last_error: error,
        }
    }

    fn is_throttled(&self, key: Option<&str>) -> bool {
        let Some(key) = key else {
            return false;
        };
        let now = self.clock.now_ms();
        let failures = self.breaker.snapshot().failure_count.min(4);
        let interval = duration_ms(self.config.non_critical_min_interval).saturating_mul(1 << failures);

        let mut last_write = self
            .last_write_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last_write.get(key) {
            Some(previous) if now.saturating_sub(*previous) < interval => true,
            _ => {
                last_write.insert(key.to_string(), now);
                false
            }
        }
    }

    fn publish_state(&self) {
        if let Some(metrics) = GOVERNOR_METRICS.get() {
            metrics.circuit_state.set(self.breaker.state().as_gauge());
        }
    }
}

#[cfg(test)]
mod tests;
