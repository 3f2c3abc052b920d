//! Pod-level operations: delete with a strategy-dependent grace period,
//! readiness wait with a stability window, and the pod-exec plumbing shared
//! by the decommission and routing activities.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, DeleteParams};
use kube::Api;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::engine::ActivityContext;
use crate::error::{classify_kube_error, ActivityError};
use crate::types::PodRestartInput;

/// Grace period for pod deletion: long enough for the pre-stop hook to run
/// the decommission utility, short otherwise.
pub fn deletion_grace_period(has_dc_util: bool, dc_util_timeout: u64) -> u32 {
    if has_dc_util {
        (dc_util_timeout + 60) as u32
    } else {
        30
    }
}

/// Poll interval while waiting for readiness.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// The pod must hold Ready continuously for this long; a flap resets it.
const READY_STABILITY_WINDOW: Duration = Duration::from_secs(20);

pub async fn delete_pod(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &PodRestartInput,
) -> Result<(), ActivityError> {
    let grace = deletion_grace_period(input.cluster.has_dc_util, input.cluster.dc_util_timeout);

    if input.dry_run {
        info!(pod = %input.pod_name, grace, "[DRY RUN] would delete pod");
        return Ok(());
    }

    ctx.heartbeat();
    let api = Api::<Pod>::namespaced(client.clone(), &input.namespace);
    let params = DeleteParams {
        grace_period_seconds: Some(grace),
        ..Default::default()
    };
    match api.delete(&input.pod_name, &params).await {
        Ok(_) => {
            info!(pod = %input.pod_name, grace, "pod deletion requested");
            Ok(())
        }
        // Already gone: a retried delete converges.
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            info!(pod = %input.pod_name, "pod already deleted");
            Ok(())
        }
        Err(err) => Err(classify_kube_error("delete pod", &err)),
    }
}

pub async fn wait_for_pod_ready(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &PodRestartInput,
) -> Result<(), ActivityError> {
    if input.dry_run {
        info!(pod = %input.pod_name, "[DRY RUN] would wait for pod ready");
        return Ok(());
    }

    let api = Api::<Pod>::namespaced(client.clone(), &input.namespace);
    let mut stable_for = Duration::ZERO;

    loop {
        ctx.heartbeat();
        match api.get(&input.pod_name).await {
            Ok(pod) => {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref())
                    .unwrap_or("");
                if phase == "Failed" || phase == "Succeeded" {
                    return Err(ActivityError::Validation(format!(
                        "pod {} entered terminal phase {phase} while waiting for ready",
                        input.pod_name
                    )));
                }

                if pod_is_ready(&pod) {
                    if stable_for >= READY_STABILITY_WINDOW {
                        info!(
                            pod = %input.pod_name,
                            stable_secs = stable_for.as_secs(),
                            "pod ready and stable"
                        );
                        return Ok(());
                    }
                    stable_for += READY_POLL_INTERVAL;
                } else {
                    if stable_for > Duration::ZERO {
                        debug!(pod = %input.pod_name, "readiness flapped, resetting stability window");
                    }
                    stable_for = Duration::ZERO;
                }
            }
            // The pod may briefly not exist while the controller recreates it.
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                stable_for = Duration::ZERO;
            }
            Err(err) => {
                warn!(pod = %input.pod_name, error = %err, "error checking pod status");
                stable_for = Duration::ZERO;
            }
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
}

/// Run a shell command inside the `crate` container and return its stdout.
/// Non-zero exit reports the stderr tail; a missing pod maps to
/// `PodNotFound` so decommission retries do not chase deleted pods.
pub async fn exec_in_pod(
    client: &kube::Client,
    namespace: &str,
    pod_name: &str,
    script: &str,
) -> Result<String, ActivityError> {
    let api = Api::<Pod>::namespaced(client.clone(), namespace);
    let params = AttachParams::default()
        .container("crate")
        .stdin(false)
        .stdout(true)
        .stderr(true);

    let command = vec!["/bin/sh", "-c", script];
    let mut attached = api
        .exec(pod_name, command, &params)
        .await
        .map_err(|err| match classify_kube_error("exec in pod", &err) {
            ActivityError::ResourceNotFound(msg) => ActivityError::PodNotFound(msg),
            other => other,
        })?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    let stdout_reader = attached.stdout();
    let stderr_reader = attached.stderr();
    let status_fut = attached.take_status();

    if let Some(mut reader) = stdout_reader {
        let _ = reader.read_to_string(&mut stdout).await;
    }
    if let Some(mut reader) = stderr_reader {
        let _ = reader.read_to_string(&mut stderr).await;
    }

    let status = match status_fut {
        Some(fut) => fut.await,
        None => None,
    };
    attached.join().await.map_err(|err| {
        ActivityError::Transient(format!("exec stream in pod {pod_name} failed: {err}"))
    })?;

    match status {
        Some(status) if status.status.as_deref() == Some("Success") => Ok(stdout),
        Some(status) => Err(ActivityError::Transient(format!(
            "command in pod {pod_name} failed: {} {}",
            status.message.unwrap_or_default(),
            stderr.trim(),
        ))),
        // No status frame usually means the stream dropped mid-command.
        None => Err(ActivityError::Transient(format!(
            "no exec status from pod {pod_name}: {}",
            stderr.trim(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn pod(phase: &str, ready: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: ready.map(|status| {
                    vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn grace_period_follows_strategy() {
        assert_eq!(deletion_grace_period(true, 600), 660);
        assert_eq!(deletion_grace_period(true, 720), 780);
        assert_eq!(deletion_grace_period(false, 720), 30);
    }

    #[test]
    fn readiness_requires_running_and_ready_condition() {
        assert!(pod_is_ready(&pod("Running", Some("True"))));
        assert!(!pod_is_ready(&pod("Running", Some("False"))));
        assert!(!pod_is_ready(&pod("Running", None)));
        assert!(!pod_is_ready(&pod("Pending", Some("True"))));
    }
}
