//! Registry of workflow instances hosted by the worker: spawn, list, query,
//! signal, and terminate. Worker-level concurrency caps queue excess runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::activities::Activities;
use crate::engine::signals::{SignalRequest, Signals};
use crate::engine::{CancelHandle, CancelToken};
use crate::types::{ClusterRestartStatus, MultiRestartInput, MultiRestartResult};
use crate::workflows::{multi::multi_cluster_restart, WorkflowCtx};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Running,
    Completed,
    Failed,
    Terminated,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkflowSummary {
    pub id: String,
    pub kind: String,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub summary: WorkflowSummary,
    pub status: ClusterRestartStatus,
    #[serde(default)]
    pub result: Option<MultiRestartResult>,
}

struct Finished {
    at: DateTime<Utc>,
    state: WorkflowState,
    result: MultiRestartResult,
}

struct WorkflowEntry {
    id: String,
    kind: String,
    started_at: DateTime<Utc>,
    signals: Arc<Signals>,
    cancel: CancelHandle,
    cancel_token: CancelToken,
    status_rx: watch::Receiver<ClusterRestartStatus>,
    finished: Mutex<Option<Finished>>,
}

impl WorkflowEntry {
    fn summary(&self) -> WorkflowSummary {
        let finished = self.finished.lock().unwrap();
        WorkflowSummary {
            id: self.id.clone(),
            kind: self.kind.clone(),
            state: finished
                .as_ref()
                .map(|done| done.state)
                .unwrap_or(WorkflowState::Running),
            started_at: self.started_at,
            finished_at: finished.as_ref().map(|done| done.at),
        }
    }

    fn detail(&self) -> WorkflowDetail {
        // Signal latches are folded into the status so a query always sees
        // the live flags, even between workflow-side status updates.
        let mut status = self.status_rx.borrow().clone();
        status.paused = self.signals.is_paused();
        status.cancelled = status.cancelled || self.signals.is_cancelled();
        status.force_restart_active = self.signals.force_reason().is_some();

        let finished = self.finished.lock().unwrap();
        WorkflowDetail {
            summary: self.summary(),
            status,
            result: finished.as_ref().map(|done| done.result.clone()),
        }
    }
}

pub struct WorkflowRegistry {
    activities: Arc<dyn Activities>,
    entries: Mutex<HashMap<String, Arc<WorkflowEntry>>>,
    order: Mutex<Vec<String>>,
    workflow_slots: Arc<Semaphore>,
}

impl WorkflowRegistry {
    pub fn new(activities: Arc<dyn Activities>, max_concurrent_workflows: usize) -> Arc<Self> {
        Arc::new(Self {
            activities,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            workflow_slots: Arc::new(Semaphore::new(max_concurrent_workflows.max(1))),
        })
    }

    /// Spawn a multi-cluster restart workflow and return its summary.
    /// The run queues if every workflow slot is taken.
    pub fn spawn_restart(self: &Arc<Self>, input: MultiRestartInput) -> WorkflowSummary {
        let names = match &input.cluster_names {
            Some(names) if !names.is_empty() => names.join("-"),
            _ => "all".to_string(),
        };
        let id = format!("restart-{names}-{}", &Uuid::new_v4().simple().to_string()[..8]);

        let signals = Arc::new(Signals::new());
        let (cancel, cancel_token) = CancelToken::new();
        let (ctx, status_rx) = WorkflowCtx::new(
            self.activities.clone(),
            signals.clone(),
            cancel_token.clone(),
        );

        let entry = Arc::new(WorkflowEntry {
            id: id.clone(),
            kind: "restart".to_string(),
            started_at: Utc::now(),
            signals,
            cancel,
            cancel_token: cancel_token.clone(),
            status_rx,
            finished: Mutex::new(None),
        });

        self.entries
            .lock()
            .unwrap()
            .insert(id.clone(), entry.clone());
        self.order.lock().unwrap().push(id.clone());

        let slots = self.workflow_slots.clone();
        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            info!(workflow_id = %entry.id, "workflow started");
            let result = multi_cluster_restart(&ctx, input).await;

            let state = if entry.cancel_token.is_cancelled() {
                WorkflowState::Terminated
            } else if result.failed_clusters == 0 {
                WorkflowState::Completed
            } else {
                WorkflowState::Failed
            };
            info!(workflow_id = %entry.id, ?state, "workflow finished");
            *entry.finished.lock().unwrap() = Some(Finished {
                at: Utc::now(),
                state,
                result,
            });
        });

        self.get(&id).expect("just inserted").summary
    }

    pub fn get(&self, id: &str) -> Option<WorkflowDetail> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.detail())
    }

    /// Most recent first.
    pub fn list(&self, limit: usize) -> Vec<WorkflowSummary> {
        let entries = self.entries.lock().unwrap();
        let order = self.order.lock().unwrap();
        order
            .iter()
            .rev()
            .filter_map(|id| entries.get(id).map(|entry| entry.summary()))
            .take(limit)
            .collect()
    }

    /// Deliver an operator signal. Unknown workflow ids return false.
    pub fn signal(&self, id: &str, request: SignalRequest) -> bool {
        let Some(entry) = self.entries.lock().unwrap().get(id).cloned() else {
            return false;
        };
        entry.signals.deliver(request);
        true
    }

    /// Ungraceful stop: abort pending activities with `Cancelled`.
    pub fn terminate(&self, id: &str) -> bool {
        let Some(entry) = self.entries.lock().unwrap().get(id).cloned() else {
            return false;
        };
        warn!(workflow_id = %id, "terminating workflow");
        entry.cancel.cancel();
        true
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.finished.lock().unwrap().is_none())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterDiscoveryResult, RestartOptions};
    use crate::workflows::testing::{test_cluster, ScriptedActivities};

    fn restart_input(names: &[&str]) -> MultiRestartInput {
        MultiRestartInput {
            cluster_names: Some(names.iter().map(|name| name.to_string()).collect()),
            options: RestartOptions::default(),
        }
    }

    async fn wait_done(registry: &Arc<WorkflowRegistry>, id: &str) -> WorkflowDetail {
        loop {
            let detail = registry.get(id).unwrap();
            if detail.summary.state != WorkflowState::Running {
                return detail;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawns_and_completes_a_restart() {
        let fake = ScriptedActivities::new();
        fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![test_cluster("a", &["a-0"], true)],
            total_found: 1,
            errors: Vec::new(),
        });
        let registry = WorkflowRegistry::new(Arc::new(fake.clone()), 10);

        let summary = registry.spawn_restart(restart_input(&["a"]));
        assert!(summary.id.starts_with("restart-a-"));
        assert_eq!(summary.state, WorkflowState::Running);

        let detail = wait_done(&registry, &summary.id).await;
        assert_eq!(detail.summary.state, WorkflowState::Completed);
        let result = detail.result.unwrap();
        assert_eq!(result.successful_clusters, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_are_reported_failed() {
        let fake = ScriptedActivities::new();
        let mut bad = test_cluster("bad", &["bad-0"], true);
        bad.suspended = true;
        fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![bad],
            total_found: 1,
            errors: Vec::new(),
        });
        let registry = WorkflowRegistry::new(Arc::new(fake.clone()), 10);

        let summary = registry.spawn_restart(restart_input(&["bad"]));
        let detail = wait_done(&registry, &summary.id).await;
        assert_eq!(detail.summary.state, WorkflowState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn signals_route_to_the_named_workflow() {
        let fake = ScriptedActivities::new();
        fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![test_cluster("a", &["a-0", "a-1"], true)],
            total_found: 1,
            errors: Vec::new(),
        });
        let registry = WorkflowRegistry::new(Arc::new(fake.clone()), 10);
        let summary = registry.spawn_restart(restart_input(&["a"]));

        // Cancel through the registry once the first pod has restarted.
        let router = registry.clone();
        let id = summary.id.clone();
        fake.on("wait_for_pod_ready a-0", move || {
            assert!(router.signal(
                &id,
                SignalRequest::CancelRestart {
                    reason: Some("stop".to_string())
                }
            ));
        });
        assert!(!registry.signal("restart-nope-00000000", SignalRequest::ResumeRestart));

        let detail = wait_done(&registry, &summary.id).await;
        // Graceful cancel: the run finished with a cancelled record showing
        // partial progress.
        let result = detail.result.unwrap();
        assert_eq!(result.results.len(), 1);
        assert!(result.results[0].cancelled);
        assert_eq!(result.results[0].restarted_pods, vec!["a-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_aborts_a_running_workflow() {
        let fake = ScriptedActivities::new();
        // Discovery that blocks forever keeps the workflow running.
        fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![test_cluster("a", &["a-0"], true)],
            total_found: 1,
            errors: Vec::new(),
        });
        fake.set_default_health(crate::types::Health::Yellow);
        let registry = WorkflowRegistry::new(Arc::new(fake.clone()), 10);
        let summary = registry.spawn_restart(restart_input(&["a"]));

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(registry.terminate(&summary.id));
        let detail = wait_done(&registry, &summary.id).await;
        assert_eq!(detail.summary.state, WorkflowState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn list_returns_most_recent_first() {
        let fake = ScriptedActivities::new();
        fake.set_discovery(ClusterDiscoveryResult::default());
        let registry = WorkflowRegistry::new(Arc::new(fake.clone()), 10);

        let first = registry.spawn_restart(restart_input(&["a"]));
        let second = registry.spawn_restart(restart_input(&["b"]));

        let listed = registry.list(10);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(registry.list(1).len(), 1);
        assert_eq!(registry.total_count(), 2);
    }
}
