//! Maintenance gate: block until the current time lies inside a configured
//! window, or an operator `force_restart` signal overrides the wait. There
//! is no total deadline; the operator may wait arbitrarily long.

use std::time::Duration;

use tracing::{info, warn};

use crate::engine;
use crate::error::WorkflowError;
use crate::policy::OperationClass;
use crate::types::{MaintenanceWindowCheckInput, MaintenanceWindowCheckResult};

use super::WorkflowCtx;

/// How long to wait on the override signal before re-checking the window.
const RECHECK_INTERVAL: Duration = Duration::from_secs(300);

fn override_result(
    template: &MaintenanceWindowCheckResult,
    reason: &str,
) -> MaintenanceWindowCheckResult {
    MaintenanceWindowCheckResult {
        cluster_name: template.cluster_name.clone(),
        should_wait: false,
        reason: format!("Operator override: {reason}"),
        next_window_start: template.next_window_start,
        current_time: template.current_time,
        in_maintenance_window: template.in_maintenance_window,
    }
}

pub async fn maintenance_gate(
    ctx: &WorkflowCtx,
    cluster_name: &str,
    config_path: &str,
) -> Result<MaintenanceWindowCheckResult, WorkflowError> {
    let opts = OperationClass::MaintenanceCheck.options();

    loop {
        // The activity reads the clock itself; the workflow never does.
        let input = MaintenanceWindowCheckInput {
            cluster_name: cluster_name.to_string(),
            current_time: None,
            config_path: Some(config_path.to_string()),
        };
        let activities = ctx.activities.clone();
        let check = engine::execute(&ctx.cancel, &opts, "check_maintenance_window", move |actx| {
            let activities = activities.clone();
            let input = input.clone();
            async move { activities.check_maintenance_window(actx, input).await }
        })
        .await?;

        if let Some(reason) = ctx.signals.force_reason() {
            info!(cluster = cluster_name, %reason, "maintenance window override active");
            return Ok(override_result(&check, &reason));
        }

        if !check.should_wait {
            info!(cluster = cluster_name, reason = %check.reason, "maintenance gate open");
            return Ok(check);
        }

        warn!(
            cluster = cluster_name,
            reason = %check.reason,
            "outside maintenance window - waiting"
        );

        tokio::select! {
            forced = ctx.signals.wait_for_force(RECHECK_INTERVAL) => {
                if let Some(reason) = forced {
                    info!(cluster = cluster_name, %reason, "maintenance window override received");
                    return Ok(override_result(&check, &reason));
                }
                // Timed out: loop around and recompute with a fresh clock.
            }
            _ = ctx.cancel.cancelled() => return Err(WorkflowError::Cancelled),
        }
    }
}
