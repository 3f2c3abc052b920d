//! Pod-restart state machine:
//! `HEALTH_CHECK -> DECOMMISSION -> DELETE -> WAIT_READY -> RESET_ROUTING ->
//! COMPLETE`. Any failure terminates the machine; no later state runs. The
//! one exception is RESET_ROUTING, whose failure degrades to an
//! operator-actionable warning instead of failing the restart.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::{self, with_task_timeout};
use crate::error::WorkflowError;
use crate::policy::{self, OperationClass};
use crate::types::{
    DecommissionInput, HealthCheckInput, PodRestartInput, PodRestartResult, RoutingResetInput,
};

use super::health::health_gate;
use super::WorkflowCtx;

/// Task timeout for the health gate run as a child of this machine.
const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn pod_restart(ctx: &WorkflowCtx, input: PodRestartInput) -> PodRestartResult {
    let started_at = ctx.now();
    info!(pod = %input.pod_name, "starting pod restart");

    let outcome = run_states(ctx, &input).await;

    let completed_at = ctx.now();
    let duration = super::elapsed_seconds(started_at, completed_at);
    match outcome {
        Ok(()) => {
            info!(
                pod = %input.pod_name,
                duration_secs = format!("{duration:.2}"),
                "pod restart complete"
            );
            PodRestartResult {
                pod_name: input.pod_name,
                namespace: input.namespace,
                success: true,
                duration,
                error: None,
                started_at: Some(started_at),
                completed_at: Some(completed_at),
            }
        }
        Err(err) => {
            let message = format!("pod restart failed for {}: {err}", input.pod_name);
            error!("{message}");
            PodRestartResult {
                pod_name: input.pod_name,
                namespace: input.namespace,
                success: false,
                duration,
                error: Some(message),
                started_at: Some(started_at),
                completed_at: Some(completed_at),
            }
        }
    }
}

async fn run_states(ctx: &WorkflowCtx, input: &PodRestartInput) -> Result<(), WorkflowError> {
    let cluster = &input.cluster;

    // HEALTH_CHECK: the cluster must be GREEN before this pod goes away.
    with_task_timeout(
        HEALTH_GATE_TIMEOUT,
        health_gate(
            ctx,
            HealthCheckInput {
                cluster: cluster.clone(),
                dry_run: input.dry_run,
                timeout: 30,
            },
            "pod-health-gate",
        ),
    )
    .await?;

    // DECOMMISSION: strategy is a pure function of `has_dc_util`.
    let decommission_opts = policy::decommission_options(cluster);
    let activities = ctx.activities.clone();
    let decommission_input = DecommissionInput {
        pod_name: input.pod_name.clone(),
        namespace: input.namespace.clone(),
        cluster: cluster.clone(),
        dry_run: input.dry_run,
    };
    let decommission = engine::execute(
        &ctx.cancel,
        &decommission_opts,
        "decommission_pod",
        move |actx| {
            let activities = activities.clone();
            let input = decommission_input.clone();
            async move { activities.decommission_pod(actx, input).await }
        },
    )
    .await?;
    info!(
        pod = %input.pod_name,
        strategy = %decommission.strategy,
        "decommission complete"
    );

    // DELETE: grace period is chosen by the activity per strategy.
    let delete_opts = OperationClass::PodOperations.options();
    let activities = ctx.activities.clone();
    let delete_input = input.clone();
    engine::execute(&ctx.cancel, &delete_opts, "delete_pod", move |actx| {
        let activities = activities.clone();
        let input = delete_input.clone();
        async move { activities.delete_pod(actx, input).await }
    })
    .await?;

    // WAIT_READY: bounded by the caller's pod_ready_timeout.
    let ready_opts = policy::wait_ready_options(input.pod_ready_timeout);
    let activities = ctx.activities.clone();
    let ready_input = input.clone();
    engine::execute(&ctx.cancel, &ready_opts, "wait_for_pod_ready", move |actx| {
        let activities = activities.clone();
        let input = ready_input.clone();
        async move { activities.wait_for_pod_ready(actx, input).await }
    })
    .await?;

    // RESET_ROUTING: manual strategy only; uniquely non-fatal.
    if !cluster.has_dc_util {
        let reset_opts = OperationClass::RoutingReset.options();
        let activities = ctx.activities.clone();
        let reset_input = RoutingResetInput {
            pod_name: input.pod_name.clone(),
            namespace: input.namespace.clone(),
            cluster: cluster.clone(),
            dry_run: input.dry_run,
        };
        match engine::execute(&ctx.cancel, &reset_opts, "reset_routing", move |actx| {
            let activities = activities.clone();
            let input = reset_input.clone();
            async move { activities.reset_cluster_routing_allocation(actx, input).await }
        })
        .await
        {
            Ok(_) => info!(pod = %input.pod_name, "cluster routing allocation reset"),
            Err(WorkflowError::Cancelled) => return Err(WorkflowError::Cancelled),
            Err(err) => {
                warn!(
                    pod = %input.pod_name,
                    error = %err,
                    "failed to reset cluster routing allocation; the cluster stays at \"new_primaries\" until restored"
                );
                warn!(
                    "manual recovery: kubectl exec -n {} {} -c crate -- curl --insecure -sS -H 'Content-Type: application/json' -X POST https://127.0.0.1:4200/_sql -d '{{\"stmt\": \"set global transient \\\"cluster.routing.allocation.enable\\\" = \\\"all\\\"\"}}'",
                    input.namespace, input.pod_name
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, test_cluster};
    use super::*;
    use crate::types::Health;

    fn input(cluster: crate::types::CrateDBCluster, pod: &str) -> PodRestartInput {
        PodRestartInput {
            pod_name: pod.to_string(),
            namespace: cluster.namespace.clone(),
            cluster,
            dry_run: false,
            pod_ready_timeout: 300,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn kubernetes_managed_restart_skips_sql_and_reset() {
        let h = harness();
        let cluster = test_cluster("c1", &["crate-data-hot-c1-0"], true);
        let result = pod_restart(&h.ctx, input(cluster, "crate-data-hot-c1-0")).await;

        assert!(result.success);
        let calls = h.fake.recorded();
        assert_eq!(
            calls,
            vec![
                "check_cluster_health c1".to_string(),
                "decommission_pod crate-data-hot-c1-0 strategy=kubernetes_managed".to_string(),
                "delete_pod crate-data-hot-c1-0 grace=780".to_string(),
                "wait_for_pod_ready crate-data-hot-c1-0".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn manual_restart_runs_protocol_and_reset() {
        let h = harness();
        let cluster = test_cluster("c2", &["crate-data-hot-c2-0"], false);
        let result = pod_restart(&h.ctx, input(cluster, "crate-data-hot-c2-0")).await;

        assert!(result.success);
        let calls = h.fake.recorded();
        // The five protocol statements run inside the pod, in order.
        let execs: Vec<&String> = calls.iter().filter(|call| call.starts_with("exec ")).collect();
        assert_eq!(execs.len(), 5);
        assert!(execs[0].contains("new_primaries"));
        assert!(execs[1].contains("cluster.graceful_stop.timeout"));
        assert!(execs[1].contains("720s"));
        assert!(execs[2].contains("cluster.graceful_stop.force"));
        assert!(execs[3].contains("PRIMARIES"));
        assert!(execs[4].contains("alter cluster decommission $$data-hot-0$$"));
        assert!(execs[4].contains("while kill -0 1"));
        // Manual deletes use the short grace period, then routing is reset.
        assert!(calls.contains(&"delete_pod crate-data-hot-c2-0 grace=30".to_string()));
        assert_eq!(h.fake.count_of("reset_routing"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn routing_reset_failure_does_not_fail_the_restart() {
        let h = harness();
        h.fake.fail_routing_resets();
        let cluster = test_cluster("c2", &["crate-data-hot-c2-0"], false);
        let result = pod_restart(&h.ctx, input(cluster, "crate-data-hot-c2-0")).await;

        assert!(result.success, "reset failure must not fail the restart");
        // Retried to the routing_reset policy bound.
        assert_eq!(
            h.fake.count_of("reset_routing") as u32,
            OperationClass::RoutingReset.options().retry.maximum_attempts
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_never_runs_when_health_gate_fails() {
        let h = harness();
        h.fake.set_default_health(Health::Red);
        let cluster = test_cluster("c1", &["crate-data-hot-c1-0"], true);
        let result = pod_restart(&h.ctx, input(cluster, "crate-data-hot-c1-0")).await;

        assert!(!result.success);
        assert_eq!(h.fake.count_of("decommission_pod"), 0);
        assert_eq!(h.fake.count_of("delete_pod"), 0);
        assert_eq!(h.fake.count_of("wait_for_pod_ready"), 0);
    }
}
