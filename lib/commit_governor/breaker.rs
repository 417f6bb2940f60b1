use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::clock::{duration_ms, SharedClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside one window that open the circuit.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// Time spent open before a trial is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Whether a write may contact the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single write let through while half-open.
    Trial,
    Rejected,
}

/// Point-in-time view exposed on `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub open: bool,
    pub opened_at_ms: Option<u64>,
    pub failure_count: u32,
    pub window_start_ms: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    window_start_ms: u64,
    opened_at_ms: Option<u64>,
    trial_in_flight: bool,
    times_opened: u64,
}

/// Process-wide breaker guarding remote mutations.
///
/// Critical writes are always admitted; only non-critical writes are rejected while open.
/// Every write outcome still feeds the failure window, so a run of failing critical writes is
/// enough to open the circuit for everyone else.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                window_start_ms: now,
                opened_at_ms: None,
                trial_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    pub fn admit(&self, critical: bool) -> Admission {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        self.refresh(&mut inner, now);

        if critical {
            return Admission::Allowed;
        }
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen if inner.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.window_start_ms = now;
                inner.opened_at_ms = None;
                inner.trial_in_flight = false;
            }
            // A critical write squeezing through does not cut the cooldown short.
            CircuitState::Open => {}
        }
    }

    /// Records a transient failure. Returns true when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::Closed => {
                if now.saturating_sub(inner.window_start_ms) > duration_ms(self.config.failure_window)
                {
                    inner.window_start_ms = now;
                    inner.failure_count = 0;
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold.max(1) {
                    Self::trip(&mut inner, now);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                Self::trip(&mut inner, now);
                true
            }
            CircuitState::Open => {
                inner.failure_count += 1;
                false
            }
        }
    }

    /// Frees the half-open trial slot when the trial ended without a verdict.
    pub fn release_trial(&self) {
        self.lock_inner().trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now_ms();
        let mut inner = self.lock_inner();
        self.refresh(&mut inner, now);
        CircuitSnapshot {
            state: inner.state,
            open: inner.state == CircuitState::Open,
            opened_at_ms: inner.opened_at_ms,
            failure_count: inner.failure_count,
            window_start_ms: inner.window_start_ms,
            times_opened: inner.times_opened,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: u64) {
        if inner.state != CircuitState::Open {
            return;
        }
        let opened_at = inner.opened_at_ms.unwrap_or(now);
        if now.saturating_sub(opened_at) >= duration_ms(self.config.cooldown) {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn trip(inner: &mut BreakerInner, now: u64) {
        inner.state = CircuitState::Open;
        inner.opened_at_ms = Some(now);
        inner.trial_in_flight = false;
        inner.times_opened += 1;
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
