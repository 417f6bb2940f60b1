use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::server::monitoring::PIPELINE_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Stopping,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        }
    }

    fn as_gauge(self) -> i64 {
        match self {
            Self::Running => 0,
            Self::Paused => 1,
            Self::Stopping => 2,
        }
    }
}

/// Shared tri-state run control. Workers poll it between work units; nothing is preempted.
///
/// `Stopping` is terminal: later `pause`/`resume` calls are ignored.
#[derive(Clone)]
pub struct ControlHandle {
    sender: Arc<watch::Sender<RunState>>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(RunState::Running);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn state(&self) -> RunState {
        *self.sender.borrow()
    }

    pub fn pause(&self) -> RunState {
        self.transition(RunState::Paused)
    }

    pub fn resume(&self) -> RunState {
        self.transition(RunState::Running)
    }

    pub fn stop(&self) -> RunState {
        self.transition(RunState::Stopping)
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == RunState::Stopping
    }

    /// Waits while paused. Returns `false` once stopping.
    pub async fn checkpoint(&self) -> bool {
        let mut receiver = self.sender.subscribe();
        loop {
            let state = *receiver.borrow_and_update();
            match state {
                RunState::Running => return true,
                RunState::Stopping => return false,
                RunState::Paused => {
                    if receiver.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Resolves once the state becomes `Stopping`.
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so `wait_for` only fails if it is dropped.
        let _ = receiver
            .wait_for(|state| *state == RunState::Stopping)
            .await;
    }

    fn transition(&self, next: RunState) -> RunState {
        let mut changed = false;
        self.sender.send_if_modified(|current| {
            if *current == RunState::Stopping || *current == next {
                return false;
            }
            *current = next;
            changed = true;
            true
        });
        let state = self.state();
        if changed {
            info!(event = "run_state_changed", state = state.as_str(), "run state changed");
            if let Some(metrics) = PIPELINE_METRICS.get() {
                metrics.run_state.set(state.as_gauge());
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ControlHandle, RunState};

    #[tokio::test]
    async fn checkpoint_waits_while_paused() {
        let control = ControlHandle::new();
        assert!(control.checkpoint().await);

        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn stopping_is_terminal_and_releases_waiters() {
        let control = ControlHandle::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };

        assert_eq!(control.stop(), RunState::Stopping);
        assert!(!waiter.await.expect("join"));
        assert_eq!(control.resume(), RunState::Stopping);
        control.stopped().await;
    }
}
