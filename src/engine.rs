//! Activity driver: runs effect activities under the policy table with
//! per-attempt timeouts, heartbeat liveness, bounded retries, and
//! cooperative cancellation. The backoff schedule is a pure function of the
//! attempt counter so a fixed retry sequence always produces the same waits.

pub mod registry;
pub mod signals;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::error::{ActivityError, ErrorKind, WorkflowError};
use crate::policy::{ActivityOptions, RetryPolicy};

/// Handle an activity uses to report liveness while it waits on slow
/// external state (drains, pod readiness).
#[derive(Clone)]
pub struct ActivityContext {
    beat: Arc<Notify>,
}

impl ActivityContext {
    pub fn heartbeat(&self) {
        self.beat.notify_one();
    }
}

/// Cancellation side: the holder flips it once; it never un-cancels.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side handed to workflow code and the activity driver.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that can never fire, for contexts without an external owner.
    pub fn never() -> CancelToken {
        static NEVER: once_cell::sync::Lazy<watch::Receiver<bool>> =
            once_cell::sync::Lazy::new(|| {
                let (tx, rx) = watch::channel(false);
                // Keep the sender alive forever so `changed` stays pending.
                std::mem::forget(tx);
                rx
            });
        CancelToken { rx: NEVER.clone() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pending forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Owner gone without cancelling; nothing can fire anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Exponential backoff with deterministic jitter. `attempt` counts completed
/// attempts, starting at 1. The jitter factor walks 0.10..0.28 with the
/// attempt number, so replays of the same attempt sequence wait identically.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.initial_interval.as_secs_f64()
        * policy.backoff_coefficient.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(policy.maximum_interval.as_secs_f64());
    let jitter_factor = 0.1 + f64::from(attempt % 10) * 0.02;
    Duration::from_secs_f64(capped * (1.0 + jitter_factor))
}

/// Run one activity under its policy entry.
///
/// Each attempt is bounded by `start_to_close` and by the heartbeat
/// watchdog; failures are classified and either retried with backoff or
/// surfaced immediately. The final error after exhaustion is the last
/// attempt's error, so a health gate that never saw GREEN surfaces the last
/// observed symbol.
pub async fn execute<T, F, Fut>(
    cancel: &CancelToken,
    opts: &ActivityOptions,
    label: &str,
    mut call: F,
) -> Result<T, WorkflowError>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let max_attempts = opts.retry.maximum_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        match run_attempt(cancel, opts, &mut call).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let kind = err.kind();
                if kind == ErrorKind::Cancelled {
                    return Err(WorkflowError::Cancelled);
                }
                if !opts.retry.is_retryable(kind) {
                    warn!(activity = label, attempt, error = %err, "non-retryable failure");
                    return Err(WorkflowError::Activity(err));
                }
                if attempt >= max_attempts {
                    warn!(activity = label, attempt, error = %err, "retries exhausted");
                    return Err(WorkflowError::Activity(err));
                }
                let delay = backoff_delay(&opts.retry, attempt);
                debug!(
                    activity = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
                }
            }
        }
    }
}

async fn run_attempt<T, F, Fut>(
    cancel: &CancelToken,
    opts: &ActivityOptions,
    call: &mut F,
) -> Result<T, ActivityError>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let beat = Arc::new(Notify::new());
    let ctx = ActivityContext { beat: beat.clone() };
    let fut = call(ctx);
    tokio::pin!(fut);

    let attempt = async {
        tokio::select! {
            res = &mut fut => res,
            _ = heartbeat_watchdog(beat, opts.heartbeat_timeout) => {
                Err(ActivityError::Transient(format!(
                    "no heartbeat for {:?}",
                    opts.heartbeat_timeout
                )))
            }
            _ = cancel.cancelled() => Err(ActivityError::Cancelled("workflow cancelled".to_string())),
        }
    };

    match tokio::time::timeout(opts.start_to_close, attempt).await {
        Ok(res) => res,
        Err(_) => Err(ActivityError::Transient(format!(
            "start-to-close timeout after {:?}",
            opts.start_to_close
        ))),
    }
}

/// Resolves only when the activity stops heartbeating for a full timeout.
async fn heartbeat_watchdog(beat: Arc<Notify>, timeout: Duration) {
    loop {
        if tokio::time::timeout(timeout, beat.notified()).await.is_err() {
            return;
        }
    }
}

/// Workflow-layer sleep that aborts on external cancellation.
pub async fn sleep(cancel: &CancelToken, duration: Duration) -> Result<(), WorkflowError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
    }
}

/// Bound a child workflow by its task timeout (spec'd per child kind).
pub async fn with_task_timeout<T, Fut>(
    duration: Duration,
    fut: Fut,
) -> Result<T, WorkflowError>
where
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(res) => res,
        Err(_) => Err(WorkflowError::TaskTimeout(duration)),
    }
}
