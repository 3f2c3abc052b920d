//! Post-restart routing-allocation reset.
//!
//! Manual decommission leaves the cluster at `new_primaries`; this restores
//! `all`. The target pod is tried first, then its peers in list order, so a
//! not-yet-responsive target does not leave the cluster degraded.

use std::time::Instant;

use tracing::{info, warn};

use crate::engine::ActivityContext;
use crate::error::ActivityError;
use crate::types::{RoutingResetInput, RoutingResetResult};

use super::decommission::sql_curl_command;
use super::pods::exec_in_pod;

pub const RESET_ROUTING_STATEMENT: &str =
    r#"set global transient "cluster.routing.allocation.enable" = "all""#;

pub async fn reset_cluster_routing_allocation(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &RoutingResetInput,
) -> Result<RoutingResetResult, ActivityError> {
    let started = Instant::now();

    if input.dry_run {
        info!(pod = %input.pod_name, "[DRY RUN] would reset cluster routing allocation");
        return Ok(RoutingResetResult {
            pod_name: input.pod_name.clone(),
            namespace: input.namespace.clone(),
            cluster_name: input.cluster.name.clone(),
            success: true,
            duration: 0.0,
            error: None,
        });
    }

    let command = sql_curl_command(RESET_ROUTING_STATEMENT);

    // Target pod first, then every other member in list order.
    let candidates = std::iter::once(&input.pod_name).chain(
        input
            .cluster
            .pods
            .iter()
            .filter(|pod| *pod != &input.pod_name),
    );

    let mut failures = Vec::new();
    for pod in candidates {
        ctx.heartbeat();
        match exec_in_pod(client, &input.namespace, pod, &command).await {
            Ok(_) => {
                info!(
                    cluster = %input.cluster.name,
                    via_pod = %pod,
                    "cluster routing allocation reset to \"all\""
                );
                return Ok(RoutingResetResult {
                    pod_name: input.pod_name.clone(),
                    namespace: input.namespace.clone(),
                    cluster_name: input.cluster.name.clone(),
                    success: true,
                    duration: started.elapsed().as_secs_f64(),
                    error: None,
                });
            }
            Err(err) => {
                warn!(pod = %pod, error = %err, "routing reset attempt failed");
                failures.push(format!("{pod}: {err}"));
            }
        }
    }

    Err(ActivityError::Transient(format!(
        "failed to reset routing allocation on any pod of cluster {}: {}",
        input.cluster.name,
        failures.join("; ")
    )))
}
