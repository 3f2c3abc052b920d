//! Multi-cluster orchestrator: discover clusters, then restart each one
//! sequentially. A failing cluster is isolated; the orchestrator carries on
//! with the next one and returns a mixed record. A graceful cancel stops
//! the run before the next cluster starts.

use tracing::{error, info, warn};

use crate::engine;
use crate::error::WorkflowError;
use crate::policy;
use crate::types::{
    ClusterDiscoveryInput, ClusterDiscoveryResult, MultiRestartInput, MultiRestartResult,
};

use super::cluster::cluster_restart;
use super::WorkflowCtx;

pub async fn multi_cluster_restart(
    ctx: &WorkflowCtx,
    input: MultiRestartInput,
) -> MultiRestartResult {
    let started_at = ctx.now();
    info!(
        clusters = ?input.cluster_names,
        dry_run = input.options.dry_run,
        "starting multi-cluster restart"
    );

    let discovery = match discover(ctx, &input).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "cluster discovery failed");
            let completed_at = ctx.now();
            return MultiRestartResult {
                results: Vec::new(),
                total_clusters: 0,
                successful_clusters: 0,
                failed_clusters: 1,
                total_duration: super::elapsed_seconds(started_at, completed_at),
                started_at: Some(started_at),
                completed_at: Some(completed_at),
            };
        }
    };

    for error in &discovery.errors {
        warn!("discovery: {error}");
    }
    if discovery.clusters.is_empty() {
        warn!("no clusters found to restart");
        let completed_at = ctx.now();
        return MultiRestartResult {
            results: Vec::new(),
            total_clusters: 0,
            successful_clusters: 0,
            failed_clusters: 0,
            total_duration: super::elapsed_seconds(started_at, completed_at),
            started_at: Some(started_at),
            completed_at: Some(completed_at),
        };
    }

    info!(count = discovery.clusters.len(), "restarting discovered clusters");

    let mut results = Vec::with_capacity(discovery.clusters.len());
    for cluster in discovery.clusters {
        if ctx.cancel.is_cancelled() {
            warn!("workflow cancelled; stopping the run");
            break;
        }
        if ctx.signals.is_cancelled() {
            warn!("cancel latched between clusters; stopping the run");
            break;
        }

        let name = cluster.name.clone();
        let record = cluster_restart(ctx, cluster, input.options.clone()).await;
        let stop = record.cancelled;
        if record.success {
            info!(cluster = %name, "cluster restart succeeded");
        } else {
            error!(cluster = %name, error = ?record.error, "cluster restart failed");
        }
        results.push(record);

        if stop {
            warn!(cluster = %name, "run cancelled; remaining clusters are not restarted");
            break;
        }
    }

    let completed_at = ctx.now();
    let successful = results.iter().filter(|record| record.success).count();
    let failed = results.len() - successful;
    info!(
        total = results.len(),
        successful,
        failed,
        "multi-cluster restart complete"
    );

    MultiRestartResult {
        total_clusters: results.len(),
        successful_clusters: successful,
        failed_clusters: failed,
        total_duration: super::elapsed_seconds(started_at, completed_at),
        results,
        started_at: Some(started_at),
        completed_at: Some(completed_at),
    }
}

async fn discover(
    ctx: &WorkflowCtx,
    input: &MultiRestartInput,
) -> Result<ClusterDiscoveryResult, WorkflowError> {
    let opts = policy::discovery_options();
    let activities = ctx.activities.clone();
    let discovery_input = ClusterDiscoveryInput {
        cluster_names: input.cluster_names.clone(),
        kubeconfig: input.options.kubeconfig.clone(),
        context: input.options.context.clone(),
        maintenance_config_path: input.options.maintenance_config_path.clone(),
    };
    engine::execute(&ctx.cancel, &opts, "discover_clusters", move |actx| {
        let activities = activities.clone();
        let input = discovery_input.clone();
        async move { activities.discover_clusters(actx, input).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, test_cluster};
    use super::*;
    use crate::types::{ClusterDiscoveryResult, RestartOptions};

    fn multi_input(names: &[&str]) -> MultiRestartInput {
        MultiRestartInput {
            cluster_names: Some(names.iter().map(|name| name.to_string()).collect()),
            options: RestartOptions::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_discovered_clusters_sequentially() {
        let h = harness();
        h.fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![
                test_cluster("a", &["a-0"], true),
                test_cluster("b", &["b-0"], true),
            ],
            total_found: 2,
            errors: Vec::new(),
        });

        let result = multi_cluster_restart(&h.ctx, multi_input(&["a", "b"])).await;

        assert_eq!(result.total_clusters, 2);
        assert_eq!(result.successful_clusters, 2);
        assert_eq!(result.failed_clusters, 0);
        let calls = h.fake.recorded();
        let pos = |needle: &str| calls.iter().position(|c| c.starts_with(needle)).unwrap();
        // Cluster b starts only after cluster a's pod finished.
        assert!(pos("wait_for_pod_ready a-0") < pos("validate_cluster b"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cluster_is_isolated() {
        let h = harness();
        let mut bad = test_cluster("bad", &["bad-0"], true);
        bad.suspended = true;
        h.fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![bad, test_cluster("good", &["good-0"], true)],
            total_found: 2,
            errors: Vec::new(),
        });

        let result = multi_cluster_restart(&h.ctx, multi_input(&["bad", "good"])).await;

        assert_eq!(result.total_clusters, 2);
        assert_eq!(result.successful_clusters, 1);
        assert_eq!(result.failed_clusters, 1);
        assert!(!result.results[0].success);
        assert!(result.results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_discovery_returns_empty_record() {
        let h = harness();
        h.fake.set_discovery(ClusterDiscoveryResult::default());

        let result = multi_cluster_restart(&h.ctx, multi_input(&["missing"])).await;

        assert_eq!(result.total_clusters, 0);
        assert_eq!(result.successful_clusters, 0);
        assert_eq!(result.failed_clusters, 0);
        assert!(result.results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cluster_stops_the_run() {
        let h = harness();
        h.fake.set_discovery(ClusterDiscoveryResult {
            clusters: vec![
                test_cluster("a", &["a-0", "a-1"], true),
                test_cluster("b", &["b-0"], true),
            ],
            total_found: 2,
            errors: Vec::new(),
        });
        // Cancel during cluster a's first pod.
        h.fake.on("wait_for_pod_ready a-0", {
            let signals = h.signals.clone();
            move || signals.cancel_restart("operator stop")
        });

        let result = multi_cluster_restart(&h.ctx, multi_input(&["a", "b"])).await;

        assert_eq!(result.total_clusters, 1);
        assert!(result.results[0].cancelled);
        // Cluster b never started.
        assert_eq!(h.fake.count_of("validate_cluster b"), 0);
    }
}
