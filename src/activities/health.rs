//! Cluster health observation.
//!
//! The activity only succeeds on GREEN: any other symbol raises a retryable
//! `HealthNotGreen`, so the policy table's retry loop is the polling loop.

use chrono::Utc;
use kube::core::DynamicObject;
use tracing::{debug, info};

use crate::engine::ActivityContext;
use crate::error::{classify_kube_error, ActivityError};
use crate::types::{Health, HealthCheckInput, HealthCheckResult};

use super::discovery::cratedb_api;

/// Read the health symbol from the custom resource status.
/// `status.crateDBStatus.health` is preferred, `status.health` is the
/// fallback; anything absent or unrecognized is UNKNOWN.
pub fn extract_health(item: &DynamicObject) -> Health {
    let status = item.data.pointer("/status/crateDBStatus/health").or_else(|| {
        item.data.pointer("/status/health")
    });
    status
        .and_then(|value| value.as_str())
        .map(Health::parse)
        .unwrap_or(Health::Unknown)
}

pub async fn check_cluster_health(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &HealthCheckInput,
) -> Result<HealthCheckResult, ActivityError> {
    let cluster = &input.cluster;

    if input.dry_run {
        info!(cluster = %cluster.name, "[DRY RUN] would check cluster health");
        return Ok(HealthCheckResult::observed(
            &cluster.name,
            Health::Green,
            Utc::now(),
        ));
    }

    ctx.heartbeat();
    let crd = cratedb_api(client, &cluster.namespace)
        .get(&cluster.crd_name)
        .await
        .map_err(|err| classify_kube_error("read CrateDB resource", &err))?;

    let health = extract_health(&crd);
    debug!(cluster = %cluster.name, %health, "observed cluster health");

    if health.is_green() {
        Ok(HealthCheckResult::observed(
            &cluster.name,
            health,
            Utc::now(),
        ))
    } else {
        Err(ActivityError::HealthNotGreen { health })
    }
}
