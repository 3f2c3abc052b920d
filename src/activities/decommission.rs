//! Graceful decommission, in two strategies keyed on the cluster's
//! pre-stop hook capability.
//!
//! Kubernetes-managed clusters do no pre-delete work here: the deletion
//! grace period triggers the pre-stop hook, which runs the utility inside
//! the container. Manual clusters get the five-statement SQL protocol
//! executed against the local SQL endpoint, ending in a busy-wait on PID 1
//! so the activity returns only once the database process has exited.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::engine::ActivityContext;
use crate::error::ActivityError;
use crate::types::{
    CrateDBCluster, DecommissionInput, DecommissionResult, DecommissionStrategy,
};

use super::pods::exec_in_pod;

/// Interval for liveness beats during the long drain wait.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// SQL endpoint reachable inside each pod.
const SQL_URL: &str = "https://127.0.0.1:4200/_sql";

pub fn select_strategy(cluster: &CrateDBCluster) -> DecommissionStrategy {
    if cluster.has_dc_util {
        DecommissionStrategy::KubernetesManaged
    } else {
        DecommissionStrategy::Manual
    }
}

/// The ordinal suffix after the final `-` in the pod name; CrateDB node
/// names are `data-hot-<ordinal>`.
pub fn pod_ordinal_suffix(pod_name: &str) -> &str {
    pod_name.rsplit('-').next().unwrap_or(pod_name)
}

/// Shell command POSTing one SQL statement to the local endpoint.
pub fn sql_curl_command(statement: &str) -> String {
    let payload = serde_json::json!({ "stmt": statement }).to_string();
    format!(
        "curl --insecure -sS -H 'Content-Type: application/json' -X POST {SQL_URL} -d '{payload}'"
    )
}

/// The five statements of the manual protocol, in order. The final command
/// also waits for the database process (PID 1) to exit.
pub fn manual_decommission_commands(cluster: &CrateDBCluster, pod_name: &str) -> Vec<String> {
    let prepare = [
        r#"set global transient "cluster.routing.allocation.enable" = "new_primaries""#.to_string(),
        format!(
            r#"set global transient "cluster.graceful_stop.timeout" = "{}s""#,
            cluster.dc_util_timeout
        ),
        r#"set global transient "cluster.graceful_stop.force" = true"#.to_string(),
        format!(
            r#"set global transient "cluster.graceful_stop.min_availability" = "{}""#,
            cluster.min_availability
        ),
    ];

    let decommission = format!(
        "alter cluster decommission $$data-hot-{}$$",
        pod_ordinal_suffix(pod_name)
    );

    let mut commands: Vec<String> = prepare.iter().map(|stmt| sql_curl_command(stmt)).collect();
    commands.push(format!(
        "{} && while kill -0 1 2>/dev/null; do sleep 0.5; done",
        sql_curl_command(&decommission)
    ));
    commands
}

pub async fn decommission_pod(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &DecommissionInput,
) -> Result<DecommissionResult, ActivityError> {
    let cluster = &input.cluster;
    let strategy = select_strategy(cluster);
    let started = Instant::now();

    let result = |success, duration: f64, process_exited, error: Option<String>| DecommissionResult {
        pod_name: input.pod_name.clone(),
        namespace: input.namespace.clone(),
        strategy,
        success,
        duration,
        error,
        process_exited,
        timeout: cluster.dc_util_timeout,
    };

    match strategy {
        DecommissionStrategy::KubernetesManaged => {
            // The pre-stop hook does the work once the pod is deleted.
            ctx.heartbeat();
            info!(
                pod = %input.pod_name,
                timeout = cluster.dc_util_timeout,
                "kubernetes-managed decommission: deferring to pre-stop hook"
            );
            Ok(result(true, started.elapsed().as_secs_f64(), false, None))
        }
        DecommissionStrategy::Manual => {
            if input.dry_run {
                info!(pod = %input.pod_name, "[DRY RUN] would run manual decommission protocol");
                return Ok(result(true, 5.0, false, None));
            }

            let commands = manual_decommission_commands(cluster, &input.pod_name);
            let total = commands.len();
            for (index, command) in commands.iter().enumerate() {
                debug!(
                    pod = %input.pod_name,
                    step = index + 1,
                    total,
                    "manual decommission step"
                );
                run_with_heartbeat(&ctx, exec_in_pod(client, &input.namespace, &input.pod_name, command))
                    .await?;
                ctx.heartbeat();
            }

            let duration = started.elapsed().as_secs_f64();
            info!(
                pod = %input.pod_name,
                duration_secs = format!("{duration:.1}"),
                "manual decommission complete, database process exited"
            );
            Ok(result(true, duration, true, None))
        }
    }
}

/// Drive a future while emitting liveness beats so the watchdog does not
/// fail the activity during a long drain.
async fn run_with_heartbeat<T>(
    ctx: &ActivityContext,
    fut: impl std::future::Future<Output = Result<T, ActivityError>>,
) -> Result<T, ActivityError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            res = &mut fut => return res,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => ctx.heartbeat(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Health, MinAvailability};

    fn cluster(has_dc_util: bool) -> CrateDBCluster {
        CrateDBCluster {
            name: "c2".to_string(),
            namespace: "prod".to_string(),
            statefulset_name: "crate-data-hot-c2".to_string(),
            health: Health::Green,
            replicas: 1,
            pods: vec!["crate-data-hot-c2-0".to_string()],
            has_prestop_hook: has_dc_util,
            has_dc_util,
            suspended: false,
            crd_name: "c2".to_string(),
            dc_util_timeout: 720,
            min_availability: MinAvailability::Primaries,
        }
    }

    #[test]
    fn strategy_is_a_function_of_dc_util() {
        assert_eq!(
            select_strategy(&cluster(true)),
            DecommissionStrategy::KubernetesManaged
        );
        assert_eq!(select_strategy(&cluster(false)), DecommissionStrategy::Manual);
    }

    #[test]
    fn ordinal_suffix_is_after_final_dash() {
        assert_eq!(pod_ordinal_suffix("crate-data-hot-c2-0"), "0");
        assert_eq!(pod_ordinal_suffix("crate-data-hot-c2-12"), "12");
        assert_eq!(pod_ordinal_suffix("nodash"), "nodash");
    }

    #[test]
    fn manual_protocol_statements_in_order() {
        let commands = manual_decommission_commands(&cluster(false), "crate-data-hot-c2-0");
        assert_eq!(commands.len(), 5);
        assert!(commands[0].contains(r#"\"cluster.routing.allocation.enable\" = \"new_primaries\""#));
        assert!(commands[1].contains(r#"\"cluster.graceful_stop.timeout\" = \"720s\""#));
        assert!(commands[2].contains(r#"\"cluster.graceful_stop.force\" = true"#));
        assert!(commands[3].contains(r#"\"cluster.graceful_stop.min_availability\" = \"PRIMARIES\""#));
        assert!(commands[4].contains("alter cluster decommission $$data-hot-0$$"));
        assert!(commands[4].contains("while kill -0 1 2>/dev/null; do sleep 0.5; done"));
    }

    #[test]
    fn curl_command_targets_local_sql_endpoint() {
        let command = sql_curl_command("select 1");
        assert!(command.starts_with("curl --insecure"));
        assert!(command.contains("https://127.0.0.1:4200/_sql"));
        assert!(command.contains(r#"-d '{"stmt":"select 1"}'"#));
        assert!(command.contains("Content-Type: application/json"));
    }

    #[test]
    fn min_availability_is_templated() {
        let mut manual = cluster(false);
        manual.min_availability = MinAvailability::Full;
        let commands = manual_decommission_commands(&manual, "crate-data-hot-c2-0");
        assert!(commands[3].contains(r#"\"FULL\""#));
    }
}
