//! Cluster-restart state machine:
//! `MAINTENANCE_CHECK -> VALIDATION -> INITIAL_HEALTH -> POD_RESTARTS ->
//! FINAL_HEALTH -> COMPLETE`, with operator signals (force / pause / resume
//! / cancel) and a live status query. Pods restart strictly one at a time;
//! failures terminate the run with a record showing partial progress.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::{self, with_task_timeout};
use crate::error::WorkflowError;
use crate::policy::OperationClass;
use crate::types::{
    ClusterValidationInput, CrateDBCluster, Health, HealthCheckInput, PodRestartInput,
    PodRestartResult, RestartOptions, RestartResult,
};

use super::health::health_gate;
use super::maintenance::maintenance_gate;
use super::pod::pod_restart;
use super::WorkflowCtx;

/// Stabilization pause between a pod completing and the inter-pod gate.
const INTER_POD_STABILIZATION: Duration = Duration::from_secs(5);
/// Task timeout for health gates run from this machine.
const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(600);
/// Reduced budget for the initial health check: roughly five minutes of
/// backoff instead of the gate's full schedule, so exhaustion still reports
/// the last observed symbol.
const INITIAL_HEALTH_TIMEOUT: Duration = Duration::from_secs(300);
const INITIAL_HEALTH_MAX_ATTEMPTS: u32 = 10;
/// Upper bound on a single operator pause.
const MAX_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

enum LoopExit {
    Completed,
    Cancelled,
}

pub async fn cluster_restart(
    ctx: &WorkflowCtx,
    cluster: CrateDBCluster,
    options: RestartOptions,
) -> RestartResult {
    let started_at = ctx.now();
    info!(cluster = %cluster.name, pods = cluster.pods.len(), "starting cluster restart");

    // Latches apply to one cluster run; a multi-cluster run reuses the
    // same signal surface for each cluster in turn.
    ctx.signals.reset_for_run();
    ctx.update_status(|status| {
        *status = Default::default();
        status.cluster_name = Some(cluster.name.clone());
    });

    let mut restarted: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();

    let outcome = run_states(ctx, &cluster, &options, &mut restarted, &mut skipped).await;

    let completed_at = ctx.now();
    let duration = super::elapsed_seconds(started_at, completed_at);
    let total_pods = cluster.pods.len();

    let (success, cancelled, restart_error) = match outcome {
        Ok(LoopExit::Completed) => (true, false, None),
        Ok(LoopExit::Cancelled) => {
            let reason = ctx
                .signals
                .cancel_reason()
                .unwrap_or_else(|| "cancelled".to_string());
            warn!(cluster = %cluster.name, %reason, "cluster restart cancelled by operator");
            (false, true, Some(format!("restart cancelled: {reason}")))
        }
        Err(message) => {
            error!(cluster = %cluster.name, error = %message, "cluster restart failed");
            (false, false, Some(message))
        }
    };

    ctx.update_status(|status| {
        status.current_pod = None;
        status.cancelled = cancelled;
    });

    info!(
        cluster = %cluster.name,
        success,
        restarted = restarted.len(),
        skipped = skipped.len(),
        duration_secs = format!("{duration:.2}"),
        "cluster restart finished"
    );

    RestartResult {
        cluster,
        success,
        duration,
        restarted_pods: restarted,
        skipped_pods: skipped,
        total_pods,
        error: restart_error,
        started_at: Some(started_at),
        completed_at: Some(completed_at),
        cancelled,
    }
}

async fn run_states(
    ctx: &WorkflowCtx,
    cluster: &CrateDBCluster,
    options: &RestartOptions,
    restarted: &mut Vec<String>,
    skipped: &mut Vec<String>,
) -> Result<LoopExit, String> {
    // MAINTENANCE_CHECK
    if !options.ignore_maintenance_windows {
        if let Some(config_path) = options.maintenance_config_path.as_deref() {
            let gate = maintenance_gate(ctx, &cluster.name, config_path)
                .await
                .map_err(|err| format!("maintenance gate failed: {err}"))?;
            info!(cluster = %cluster.name, reason = %gate.reason, "maintenance check passed");
        }
    }

    // VALIDATION
    let validation_opts = OperationClass::ApiCalls.options();
    let activities = ctx.activities.clone();
    let validation_input = ClusterValidationInput {
        cluster: cluster.clone(),
        skip_hook_warning: options.skip_hook_warning,
    };
    let validation = engine::execute(
        &ctx.cancel,
        &validation_opts,
        "validate_cluster",
        move |actx| {
            let activities = activities.clone();
            let input = validation_input.clone();
            async move { activities.validate_cluster(actx, input).await }
        },
    )
    .await
    .map_err(|err| format!("cluster validation failed: {err}"))?;

    if !validation.is_valid {
        return Err(format!(
            "cluster validation failed: {}",
            validation.errors.join(", ")
        ));
    }
    for warning in &validation.warnings {
        warn!(cluster = %cluster.name, "{warning}");
    }

    // INITIAL_HEALTH: reduced budget; RED or UNREACHABLE is a hard stop,
    // other non-GREEN outcomes proceed with a warning.
    let health_input = HealthCheckInput {
        cluster: cluster.clone(),
        dry_run: options.dry_run,
        timeout: options.health_check_timeout,
    };
    match with_task_timeout(
        INITIAL_HEALTH_TIMEOUT,
        super::health::health_gate_with_attempts(
            ctx,
            health_input.clone(),
            "initial-health-gate",
            Some(INITIAL_HEALTH_MAX_ATTEMPTS),
        ),
    )
    .await
    {
        Ok(_) => {}
        Err(WorkflowError::Cancelled) => return Ok(LoopExit::Cancelled),
        Err(err) => match err.health() {
            Some(health @ (Health::Red | Health::Unreachable)) => {
                return Err(format!(
                    "cannot restart cluster in unhealthy state: last observed health {health}"
                ));
            }
            _ => {
                warn!(
                    cluster = %cluster.name,
                    error = %err,
                    "initial health not GREEN, proceeding anyway"
                );
            }
        },
    }

    // POD_RESTARTS
    for (index, pod_name) in cluster.pods.iter().enumerate() {
        if ctx.signals.is_cancelled() {
            return Ok(LoopExit::Cancelled);
        }

        ctx.update_status(|status| status.current_pod = Some(pod_name.clone()));

        if ctx.signals.is_paused() {
            info!(cluster = %cluster.name, pod = %pod_name, "restart paused before pod");
            ctx.update_status(|status| status.paused = true);
            let resumed = ctx.signals.wait_until_unpaused(MAX_PAUSE).await;
            ctx.update_status(|status| status.paused = false);
            if !resumed {
                warn!(cluster = %cluster.name, "pause exceeded 24h, resuming");
            }
            if ctx.signals.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }
        }

        if options.only_on_suspended_nodes {
            match check_suspended(ctx, pod_name, &cluster.namespace).await {
                Ok(true) => {
                    info!(pod = %pod_name, "pod is on a suspended node, restarting");
                }
                Ok(false) => {
                    info!(pod = %pod_name, "skipping pod - not on a suspended node");
                    skipped.push(pod_name.clone());
                    ctx.update_status(|status| status.skipped_pods.push(pod_name.clone()));
                    continue;
                }
                Err(WorkflowError::Cancelled) => return Ok(LoopExit::Cancelled),
                Err(err) => {
                    // Fail-open: an unreadable node must not block the run.
                    warn!(pod = %pod_name, error = %err, "node check failed, skipping pod");
                    skipped.push(pod_name.clone());
                    ctx.update_status(|status| status.skipped_pods.push(pod_name.clone()));
                    continue;
                }
            }
        }

        info!(
            cluster = %cluster.name,
            pod = %pod_name,
            position = index + 1,
            total = cluster.pods.len(),
            "restarting pod"
        );

        let pod_input = PodRestartInput {
            pod_name: pod_name.clone(),
            namespace: cluster.namespace.clone(),
            cluster: cluster.clone(),
            dry_run: options.dry_run,
            pod_ready_timeout: options.pod_ready_timeout,
        };
        let task_timeout = Duration::from_secs(options.pod_ready_timeout + 600);
        let pod_result = match tokio::time::timeout(task_timeout, pod_restart(ctx, pod_input)).await
        {
            Ok(result) => result,
            Err(_) => PodRestartResult {
                pod_name: pod_name.clone(),
                namespace: cluster.namespace.clone(),
                success: false,
                duration: task_timeout.as_secs_f64(),
                error: Some(format!("pod restart timed out after {task_timeout:?}")),
                started_at: None,
                completed_at: None,
            },
        };

        if !pod_result.success {
            return Err(format!(
                "failed to restart pod {pod_name}: {}",
                pod_result.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }

        restarted.push(pod_name.clone());
        ctx.update_status(|status| {
            status.pods_completed.push(pod_name.clone());
            status.current_pod = None;
        });

        // Inter-pod gate: not after the last pod.
        if index < cluster.pods.len() - 1 {
            engine::sleep(&ctx.cancel, INTER_POD_STABILIZATION)
                .await
                .map_err(|err| format!("{err}"))?;
            with_task_timeout(
                HEALTH_GATE_TIMEOUT,
                health_gate(ctx, health_input.clone(), "inter-pod-health-gate"),
            )
            .await
            .map_err(|err| {
                format!(
                    "cluster health gate failed after restarting pod {pod_name}: {err} (restarted {}/{} pods)",
                    restarted.len(),
                    cluster.pods.len()
                )
            })?;
        }
    }

    // FINAL_HEALTH: only if anything was restarted.
    if !restarted.is_empty() {
        with_task_timeout(
            HEALTH_GATE_TIMEOUT,
            health_gate(ctx, health_input, "final-health-gate"),
        )
        .await
        .map_err(|err| {
            format!(
                "final health gate failed: {err} (restarted {}/{} pods)",
                restarted.len(),
                cluster.pods.len()
            )
        })?;
    }

    Ok(LoopExit::Completed)
}

async fn check_suspended(
    ctx: &WorkflowCtx,
    pod_name: &str,
    namespace: &str,
) -> Result<bool, WorkflowError> {
    let opts = OperationClass::ApiCalls.options();
    let activities = ctx.activities.clone();
    let pod = pod_name.to_string();
    let ns = namespace.to_string();
    engine::execute(&ctx.cancel, &opts, "is_pod_on_suspended_node", move |actx| {
        let activities = activities.clone();
        let pod = pod.clone();
        let ns = ns.clone();
        async move { activities.is_pod_on_suspended_node(actx, pod, ns).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::{harness, test_cluster};
    use super::*;
    use crate::types::MinAvailability;

    fn options() -> RestartOptions {
        RestartOptions {
            pod_ready_timeout: 300,
            health_check_timeout: 300,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_kubernetes_managed() {
        let h = harness();
        let mut cluster = test_cluster("c1", &["c1-0", "c1-1", "c1-2"], true);
        cluster.dc_util_timeout = 600;

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(result.success);
        assert!(!result.cancelled);
        assert_eq!(result.restarted_pods, vec!["c1-0", "c1-1", "c1-2"]);
        assert!(result.skipped_pods.is_empty());
        assert_eq!(result.total_pods, 3);

        let calls = h.fake.recorded();
        // No maintenance config, so the first call is validation.
        assert_eq!(calls[0], "validate_cluster c1");
        // Deletion grace derives from the 600s drain budget.
        assert_eq!(h.fake.count_of("delete_pod c1-0 grace=660"), 1);
        assert_eq!(h.fake.count_of("delete_pod c1-1 grace=660"), 1);
        assert_eq!(h.fake.count_of("delete_pod c1-2 grace=660"), 1);
        // Kubernetes-managed: no SQL protocol, no routing reset.
        assert_eq!(h.fake.count_of("exec "), 0);
        assert_eq!(h.fake.count_of("reset_routing"), 0);
        // Health gates: initial + 3 per-pod + 2 inter-pod + final.
        assert_eq!(h.fake.count_of("check_cluster_health"), 7);

        // Deletes are strictly ordered: each pod's delete happens after the
        // previous pod's ready wait.
        let position = |needle: &str| calls.iter().position(|call| call.starts_with(needle)).unwrap();
        assert!(position("delete_pod c1-0") < position("wait_for_pod_ready c1-0"));
        assert!(position("wait_for_pod_ready c1-0") < position("delete_pod c1-1"));
        assert!(position("wait_for_pod_ready c1-1") < position("delete_pod c1-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cluster_with_failing_reset_still_succeeds() {
        let h = harness();
        h.fake.fail_routing_resets();
        let mut cluster = test_cluster("c2", &["crate-data-hot-c2-0"], false);
        cluster.min_availability = MinAvailability::Primaries;

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(result.success, "routing reset failure is non-fatal");
        assert_eq!(result.restarted_pods, vec!["crate-data-hot-c2-0"]);
        // Single pod: no inter-pod gate, but initial + pod + final gates ran.
        assert_eq!(h.fake.count_of("check_cluster_health"), 3);
        let execs = h.fake.count_of("exec ");
        assert_eq!(execs, 5, "full SQL protocol must run");
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_cluster_fails_validation() {
        let h = harness();
        let mut cluster = test_cluster("c1", &["c1-0"], true);
        cluster.suspended = true;

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("SUSPENDED"));
        assert!(result.restarted_pods.is_empty());
        assert_eq!(h.fake.count_of("delete_pod"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_node_filter_skips_active_nodes() {
        let h = harness();
        let cluster = test_cluster("c3", &["p1", "p2", "p3", "p4"], true);
        h.fake.set_suspended("p2", true);
        h.fake.set_suspended("p4", true);

        let mut opts = options();
        opts.only_on_suspended_nodes = true;

        let result = cluster_restart(&h.ctx, cluster, opts).await;

        assert!(result.success);
        assert_eq!(result.restarted_pods, vec!["p2", "p4"]);
        assert_eq!(result.skipped_pods, vec!["p1", "p3"]);
        // Skipped pods never see a delete.
        assert_eq!(h.fake.count_of("delete_pod p1"), 0);
        assert_eq!(h.fake.count_of("delete_pod p3"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn node_check_errors_fail_open_to_skip() {
        let h = harness();
        h.fake.fail_node_checks("node api down");
        let cluster = test_cluster("c3", &["p1", "p2"], true);

        let mut opts = options();
        opts.only_on_suspended_nodes = true;

        let result = cluster_restart(&h.ctx, cluster, opts).await;

        assert!(result.success);
        assert!(result.restarted_pods.is_empty());
        assert_eq!(result.skipped_pods, vec!["p1", "p2"]);
        assert_eq!(h.fake.count_of("delete_pod"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn red_initial_health_is_a_hard_stop() {
        let h = harness();
        h.fake.set_default_health(Health::Red);
        let cluster = test_cluster("c1", &["c1-0"], true);

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(!result.success);
        assert!(result
            .error
            .unwrap()
            .contains("cannot restart cluster in unhealthy state"));
        assert_eq!(h.fake.count_of("delete_pod"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_cancel_stops_before_next_pod() {
        let h = harness();
        let cluster = test_cluster("c1", &["p0", "p1"], true);

        // Pause as soon as p0's restart finishes its ready wait.
        h.fake.on("wait_for_pod_ready p0", {
            let signals = h.signals.clone();
            move || signals.pause("operator pause")
        });

        let signals = h.signals.clone();
        let ctx = h.ctx.clone();
        let run = tokio::spawn(async move { cluster_restart(&ctx, cluster, options()).await });

        // Wait until the workflow reports the pause before p1.
        let mut status_rx = h.status_rx.clone();
        loop {
            let status = status_rx.borrow().clone();
            if status.paused {
                assert_eq!(status.current_pod.as_deref(), Some("p1"));
                assert_eq!(status.pods_completed, vec!["p0"]);
                break;
            }
            if status_rx.changed().await.is_err() {
                panic!("status channel closed before pause was observed");
            }
        }

        signals.cancel_restart("operator cancel");
        let result = run.await.unwrap();

        assert!(!result.success);
        assert!(result.cancelled);
        assert_eq!(result.restarted_pods, vec!["p0"]);
        assert_eq!(h.fake.count_of("delete_pod p1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_latch_is_checked_before_each_pod() {
        let h = harness();
        let cluster = test_cluster("c1", &["p0", "p1", "p2"], true);
        h.fake.on("wait_for_pod_ready p0", {
            let signals = h.signals.clone();
            move || signals.cancel_restart("stop now")
        });

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(!result.success);
        assert!(result.cancelled);
        assert_eq!(result.restarted_pods, vec!["p0"]);
        assert_eq!(h.fake.count_of("delete_pod p1"), 0);
        assert_eq!(h.fake.count_of("delete_pod p2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_walks_the_same_states() {
        let h = harness();
        let cluster = test_cluster("c1", &["c1-0", "c1-1"], true);
        let mut opts = options();
        opts.dry_run = true;

        let result = cluster_restart(&h.ctx, cluster, opts).await;

        assert!(result.success);
        assert_eq!(result.restarted_pods, vec!["c1-0", "c1-1"]);
        // Same call sequence shape as a real run.
        assert!(h.fake.count_of("decommission_pod") == 2);
        assert!(h.fake.count_of("delete_pod") == 2);
        assert!(h.fake.count_of("wait_for_pod_ready") == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inter_pod_gate_failure_reports_partial_progress() {
        let h = harness();
        let cluster = test_cluster("c1", &["p0", "p1"], true);
        // Gates: initial green, p0 pod gate green, then the inter-pod gate
        // never sees green again.
        h.fake.script_health([Health::Green, Health::Green]);
        h.fake.set_default_health(Health::Yellow);

        let result = cluster_restart(&h.ctx, cluster, options()).await;

        assert!(!result.success);
        assert!(!result.cancelled);
        assert_eq!(result.restarted_pods, vec!["p0"]);
        let error = result.error.unwrap();
        assert!(error.contains("after restarting pod p0"));
        assert!(error.contains("restarted 1/2 pods"));
        assert_eq!(h.fake.count_of("delete_pod p1"), 0);
    }
}
