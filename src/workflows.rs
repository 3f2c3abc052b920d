//! Workflow state machines. Everything here is written against the
//! [`Activities`] seam and the engine primitives only: time comes from the
//! engine clock, retry jitter is a pure function of the attempt counter,
//! and all I/O happens inside activities.

pub mod cluster;
pub mod health;
pub mod maintenance;
pub mod multi;
pub mod pod;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::activities::Activities;
use crate::engine::signals::Signals;
use crate::engine::CancelToken;
use crate::types::ClusterRestartStatus;

/// Shared context for one workflow instance and its children.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub activities: Arc<dyn Activities>,
    pub signals: Arc<Signals>,
    pub cancel: CancelToken,
    status: watch::Sender<ClusterRestartStatus>,
}

impl WorkflowCtx {
    pub fn new(
        activities: Arc<dyn Activities>,
        signals: Arc<Signals>,
        cancel: CancelToken,
    ) -> (Self, watch::Receiver<ClusterRestartStatus>) {
        let (status, status_rx) = watch::channel(ClusterRestartStatus::default());
        (
            Self {
                activities,
                signals,
                cancel,
                status,
            },
            status_rx,
        )
    }

    /// Engine clock. The only time source workflow code may use.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn update_status(&self, update: impl FnOnce(&mut ClusterRestartStatus)) {
        self.status.send_modify(update);
    }

    pub fn status(&self) -> ClusterRestartStatus {
        self.status.borrow().clone()
    }
}

/// Seconds between two instants on the engine clock, clamped to zero.
pub(crate) fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}
