//! Operator signals for a running restart. `force_restart` and
//! `cancel_restart` are latches: the first delivery sets them and every
//! re-delivery is a no-op. `pause`/`resume` toggle. All waits are bounded.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Signal body accepted by the worker API.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalRequest {
    ForceRestart {
        #[serde(default)]
        reason: Option<String>,
    },
    PauseRestart {
        #[serde(default)]
        reason: Option<String>,
    },
    ResumeRestart,
    CancelRestart {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Clone, Debug, Default)]
struct SignalState {
    force_reason: Option<String>,
    cancel_reason: Option<String>,
    paused: bool,
}

pub struct Signals {
    tx: watch::Sender<SignalState>,
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

impl Signals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::default());
        Self { tx }
    }

    pub fn deliver(&self, request: SignalRequest) {
        match request {
            SignalRequest::ForceRestart { reason } => {
                self.force_restart(reason.as_deref().unwrap_or("Operator override"))
            }
            SignalRequest::PauseRestart { reason } => {
                self.pause(reason.as_deref().unwrap_or("Operator pause"))
            }
            SignalRequest::ResumeRestart => self.resume(),
            SignalRequest::CancelRestart { reason } => {
                self.cancel_restart(reason.as_deref().unwrap_or("Operator cancel"))
            }
        }
    }

    pub fn force_restart(&self, reason: &str) {
        self.tx.send_modify(|state| {
            if state.force_reason.is_none() {
                info!(reason, "force restart signal latched");
                state.force_reason = Some(reason.to_string());
            }
        });
    }

    pub fn cancel_restart(&self, reason: &str) {
        self.tx.send_modify(|state| {
            if state.cancel_reason.is_none() {
                info!(reason, "cancel signal latched");
                state.cancel_reason = Some(reason.to_string());
            }
        });
    }

    pub fn pause(&self, reason: &str) {
        self.tx.send_modify(|state| {
            if !state.paused {
                info!(reason, "restart paused");
                state.paused = true;
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_modify(|state| {
            if state.paused {
                info!("restart resumed");
                state.paused = false;
            }
        });
    }

    pub fn force_reason(&self) -> Option<String> {
        self.tx.borrow().force_reason.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().cancel_reason.is_some()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.tx.borrow().cancel_reason.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.tx.borrow().paused
    }

    /// Clear latches before a cluster run. A multi-cluster run hands the same
    /// signal surface to each cluster in turn; latches apply to one run.
    pub fn reset_for_run(&self) {
        self.tx.send_modify(|state| *state = SignalState::default());
    }

    /// Wait until the force latch is set, or `timeout` elapses.
    /// Returns the override reason when woken by the signal.
    pub async fn wait_for_force(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                if let Some(reason) = rx.borrow().force_reason.clone() {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Durably wait while paused: resolves once unpaused or cancelled, or
    /// when `max` elapses. Returns whether the wait ended unpaused.
    pub async fn wait_until_unpaused(&self, max: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                {
                    let state = rx.borrow();
                    if !state.paused || state.cancel_reason.is_some() {
                        return;
                    }
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(max, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latches_are_idempotent() {
        let signals = Signals::new();
        signals.force_restart("first");
        signals.force_restart("second");
        assert_eq!(signals.force_reason().as_deref(), Some("first"));

        signals.cancel_restart("stop");
        signals.cancel_restart("stop again");
        assert_eq!(signals.cancel_reason().as_deref(), Some("stop"));
    }

    #[test]
    fn pause_resume_toggles() {
        let signals = Signals::new();
        assert!(!signals.is_paused());
        signals.pause("window closed");
        signals.pause("window closed");
        assert!(signals.is_paused());
        signals.resume();
        assert!(!signals.is_paused());
        signals.resume();
        assert!(!signals.is_paused());
    }

    #[test]
    fn reset_clears_latches() {
        let signals = Signals::new();
        signals.force_restart("go");
        signals.pause("hold");
        signals.cancel_restart("stop");
        signals.reset_for_run();
        assert_eq!(signals.force_reason(), None);
        assert!(!signals.is_paused());
        assert!(!signals.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_force_wakes_on_signal() {
        let signals = std::sync::Arc::new(Signals::new());
        let waiter = signals.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_for_force(Duration::from_secs(300)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signals.force_restart("emergency");
        let reason = handle.await.unwrap();
        assert_eq!(reason.as_deref(), Some("emergency"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_force_times_out() {
        let signals = Signals::new();
        let reason = signals.wait_for_force(Duration::from_secs(300)).await;
        assert_eq!(reason, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unpause_wait_wakes_on_resume_or_cancel() {
        let signals = std::sync::Arc::new(Signals::new());
        signals.pause("hold");

        let waiter = signals.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_unpaused(Duration::from_secs(86400)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signals.resume();
        assert!(handle.await.unwrap());

        signals.pause("hold again");
        let waiter = signals.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_unpaused(Duration::from_secs(86400)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signals.cancel_restart("abort");
        assert!(handle.await.unwrap());
    }
}
