//! Health gate: poll until the cluster reports GREEN or the retry budget is
//! exhausted. The `CheckClusterHealth` activity fails with a retryable
//! `HealthNotGreen` on any other symbol, so the policy table's retry loop
//! (exponential backoff, deterministic jitter) is the polling loop.

use tracing::info;

use crate::engine;
use crate::error::WorkflowError;
use crate::policy::OperationClass;
use crate::types::{HealthCheckInput, HealthCheckResult};

use super::WorkflowCtx;

pub async fn health_gate(
    ctx: &WorkflowCtx,
    input: HealthCheckInput,
    label: &str,
) -> Result<HealthCheckResult, WorkflowError> {
    health_gate_with_attempts(ctx, input, label, None).await
}

/// Health gate with a reduced attempt budget. Exhaustion surfaces the last
/// observed symbol, so callers can distinguish RED/UNREACHABLE endings.
pub async fn health_gate_with_attempts(
    ctx: &WorkflowCtx,
    input: HealthCheckInput,
    label: &str,
    max_attempts: Option<u32>,
) -> Result<HealthCheckResult, WorkflowError> {
    let mut opts = OperationClass::HealthCheck.options();
    if let Some(attempts) = max_attempts {
        opts.retry.maximum_attempts = attempts;
    }
    let activities = ctx.activities.clone();
    let result = engine::execute(&ctx.cancel, &opts, label, move |actx| {
        let activities = activities.clone();
        let input = input.clone();
        async move { activities.check_cluster_health(actx, input).await }
    })
    .await?;

    info!(
        cluster = %result.cluster_name,
        health = %result.health,
        gate = label,
        "cluster health is GREEN"
    );
    Ok(result)
}
