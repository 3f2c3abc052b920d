//! Cluster discovery: walk every namespace, list `cratedbs.cloud.crate.io`
//! resources, match each to its StatefulSet and pods, and analyze the
//! pre-stop hook for the decommission utility.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ListParams;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Api;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::engine::ActivityContext;
use crate::error::{classify_kube_error, ActivityError};
use crate::maintenance::MaintenanceConfig;
use crate::types::{
    ClusterDiscoveryInput, ClusterDiscoveryResult, CrateDBCluster, Health, MinAvailability,
    DEFAULT_DC_UTIL_TIMEOUT,
};

/// API handle for the CrateDB custom resource in one namespace.
pub fn cratedb_api(client: &kube::Client, namespace: &str) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("cloud.crate.io", "v1", "CrateDB");
    let ar = ApiResource::from_gvk_with_plural(&gvk, "cratedbs");
    Api::namespaced_with(client.clone(), namespace, &ar)
}

pub async fn discover_clusters(
    client: &kube::Client,
    ctx: ActivityContext,
    input: &ClusterDiscoveryInput,
) -> Result<ClusterDiscoveryResult, ActivityError> {
    let maintenance = input
        .maintenance_config_path
        .as_deref()
        .and_then(|path| match MaintenanceConfig::load(path) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable maintenance config during discovery");
                None
            }
        });

    let namespaces = Api::<Namespace>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|err| classify_kube_error("list namespaces", &err))?;
    ctx.heartbeat();

    let mut clusters = Vec::new();
    let mut errors = Vec::new();
    let mut crd_served = false;

    for namespace in &namespaces.items {
        let Some(ns_name) = namespace.metadata.name.as_deref() else {
            continue;
        };
        let crds = match cratedb_api(client, ns_name).list(&ListParams::default()).await {
            Ok(list) => {
                crd_served = true;
                list
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => continue,
            Err(err) => {
                warn!(namespace = ns_name, error = %err, "error querying namespace");
                continue;
            }
        };
        ctx.heartbeat();

        for item in crds.items {
            let crd_name = item.metadata.name.clone().unwrap_or_default();
            match process_crd_item(client, &ctx, &item, input, maintenance.as_ref()).await {
                Ok(Some(cluster)) => clusters.push(cluster),
                Ok(None) => {}
                Err(err) => {
                    let message = format!("Error processing CrateDB resource {crd_name}: {err}");
                    warn!("{message}");
                    errors.push(message);
                }
            }
        }
    }

    if !crd_served && clusters.is_empty() {
        errors.push(
            "CrateDB custom resource not served in any namespace. Is the CrateDB operator installed?"
                .to_string(),
        );
    }

    Ok(ClusterDiscoveryResult {
        total_found: clusters.len(),
        clusters,
        errors,
    })
}

async fn process_crd_item(
    client: &kube::Client,
    ctx: &ActivityContext,
    item: &DynamicObject,
    input: &ClusterDiscoveryInput,
    maintenance: Option<&MaintenanceConfig>,
) -> Result<Option<CrateDBCluster>, ActivityError> {
    let crd_name = item
        .metadata
        .name
        .clone()
        .ok_or_else(|| ActivityError::Validation("CrateDB resource without a name".to_string()))?;
    let namespace = item.metadata.namespace.clone().ok_or_else(|| {
        ActivityError::Validation(format!("CrateDB resource {crd_name} without a namespace"))
    })?;

    let cluster_name = item
        .data
        .pointer("/spec/cluster/name")
        .and_then(|value| value.as_str())
        .unwrap_or(&crd_name)
        .to_string();

    if let Some(filter) = &input.cluster_names {
        if !filter.iter().any(|name| name == &cluster_name) {
            return Ok(None);
        }
    }

    let (sts_name, sts) = find_statefulset(client, &crd_name, &cluster_name, &namespace)
        .await?
        .ok_or_else(|| {
            ActivityError::ResourceNotFound(format!(
                "could not find StatefulSet for cluster {cluster_name}"
            ))
        })?;
    ctx.heartbeat();

    let health = super::health::extract_health(item);
    let replicas = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);

    let hook = sts
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod_spec| analyze_prestop_hook(pod_spec))
        .unwrap_or_default();

    let pods = find_pods(client, &namespace, &sts_name, &crd_name, &cluster_name).await?;
    ctx.heartbeat();

    let mut dc_util_timeout = hook.dc_util_timeout;
    let mut min_availability = MinAvailability::default();
    if let Some(config) = maintenance.and_then(|config| config.cluster(&cluster_name)) {
        dc_util_timeout = config.dc_util_timeout;
        min_availability = config.min_availability;
    }

    debug!(
        cluster = %cluster_name,
        namespace = %namespace,
        statefulset = %sts_name,
        pods = pods.len(),
        has_dc_util = hook.has_dc_util,
        "discovered cluster"
    );

    Ok(Some(CrateDBCluster {
        name: cluster_name,
        namespace,
        statefulset_name: sts_name,
        health,
        replicas,
        pods,
        has_prestop_hook: hook.has_prestop_hook,
        has_dc_util: hook.has_dc_util,
        suspended: replicas == 0,
        crd_name,
        dc_util_timeout,
        min_availability,
    }))
}

/// Try the known StatefulSet naming patterns in order.
async fn find_statefulset(
    client: &kube::Client,
    crd_name: &str,
    cluster_name: &str,
    namespace: &str,
) -> Result<Option<(String, StatefulSet)>, ActivityError> {
    let api = Api::<StatefulSet>::namespaced(client.clone(), namespace);
    let mut patterns: Vec<String> = Vec::new();
    for pattern in [
        crd_name.to_string(),
        format!("crate-{crd_name}"),
        format!("crate-data-hot-{crd_name}"),
        format!("crate-{cluster_name}"),
        format!("crate-data-hot-{cluster_name}"),
    ] {
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }

    for pattern in patterns {
        match api.get(&pattern).await {
            Ok(sts) => return Ok(Some((pattern, sts))),
            Err(kube::Error::Api(resp)) if resp.code == 404 => continue,
            Err(err) => return Err(classify_kube_error("read StatefulSet", &err)),
        }
    }
    Ok(None)
}

/// Label selectors tried in order, then an owner-reference fallback.
async fn find_pods(
    client: &kube::Client,
    namespace: &str,
    sts_name: &str,
    crd_name: &str,
    cluster_name: &str,
) -> Result<Vec<String>, ActivityError> {
    let api = Api::<Pod>::namespaced(client.clone(), namespace);
    let selectors = [
        format!("app=crate,crate-cluster={crd_name}"),
        format!("app=crate,crate-cluster={cluster_name}"),
        format!("app=crate,statefulset={sts_name}"),
        "app=crate".to_string(),
    ];

    for selector in &selectors {
        let params = ListParams::default().labels(selector);
        match api.list(&params).await {
            Ok(pods) if !pods.items.is_empty() => {
                return Ok(pods
                    .items
                    .iter()
                    .filter_map(|pod| pod.metadata.name.clone())
                    .collect());
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(selector, error = %err, "pod selector attempt failed");
                continue;
            }
        }
    }

    let all_pods = api
        .list(&ListParams::default())
        .await
        .map_err(|err| classify_kube_error("list pods", &err))?;
    Ok(all_pods
        .items
        .iter()
        .filter(|pod| {
            pod.metadata
                .owner_references
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|owner| owner.kind == "StatefulSet" && owner.name == sts_name)
        })
        .filter_map(|pod| pod.metadata.name.clone())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrestopHookInfo {
    pub has_prestop_hook: bool,
    pub has_dc_util: bool,
    pub dc_util_timeout: u64,
}

impl Default for PrestopHookInfo {
    fn default() -> Self {
        Self {
            has_prestop_hook: false,
            has_dc_util: false,
            dc_util_timeout: DEFAULT_DC_UTIL_TIMEOUT,
        }
    }
}

/// Inspect the `crate` container's pre-stop hook for a decommission utility
/// invocation and its timeout.
pub fn analyze_prestop_hook(pod_spec: &k8s_openapi::api::core::v1::PodSpec) -> PrestopHookInfo {
    let mut info = PrestopHookInfo::default();

    for container in &pod_spec.containers {
        if container.name != "crate" {
            continue;
        }
        let Some(pre_stop) = container
            .lifecycle
            .as_ref()
            .and_then(|lifecycle| lifecycle.pre_stop.as_ref())
        else {
            continue;
        };
        info.has_prestop_hook = true;

        if let Some(command) = pre_stop.exec.as_ref().and_then(|exec| exec.command.as_ref()) {
            let shell = extract_shell_command(command);
            let (has_dc_util, timeout) = check_decommission_utility(&shell);
            info.has_dc_util = has_dc_util;
            info.dc_util_timeout = timeout;
        }
    }

    info
}

/// Unwrap `["/bin/sh", "-c", "<script>"]` to the script; otherwise join.
pub fn extract_shell_command(command: &[String]) -> String {
    if command.len() >= 3 && (command[0] == "/bin/sh" || command[0] == "/bin/bash") && command[1] == "-c"
    {
        command[2].clone()
    } else {
        command.join(" ")
    }
}

const DECOMMISSION_SIGNATURES: &[&str] = &[
    "dc_util",
    "dc-util",
    "dcutil",
    "decommission",
    "decomm",
    "/dc_util-",
    "/dc-util-",
];

static TIMEOUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?:--|-)(?:timeout|t)\s*(?:=|\s+)(\d+)([smh]?)").unwrap(),
        Regex::new(r"timeout\s+(\d+)([smh]?)").unwrap(),
        Regex::new(r"-min-availability\s+\w+\s+-timeout\s+(\d+)([smh]?)").unwrap(),
    ]
});

/// Whether the shell command runs the decommission utility, and the drain
/// timeout it passes (default 720 s when none is present).
pub fn check_decommission_utility(shell_command: &str) -> (bool, u64) {
    if !DECOMMISSION_SIGNATURES
        .iter()
        .any(|signature| shell_command.contains(signature))
    {
        return (false, DEFAULT_DC_UTIL_TIMEOUT);
    }

    for pattern in TIMEOUT_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(shell_command) {
            let value: u64 = match captures[1].parse() {
                Ok(value) => value,
                Err(_) => continue,
            };
            let timeout = match captures.get(2).map(|unit| unit.as_str()) {
                Some("m") => value * 60,
                Some("h") => value * 3600,
                _ => value,
            };
            return (true, timeout);
        }
    }

    (true, DEFAULT_DC_UTIL_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ExecAction, Lifecycle, LifecycleHandler, PodSpec};

    fn pod_spec_with_prestop(container_name: &str, command: Vec<&str>) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: container_name.to_string(),
                lifecycle: Some(Lifecycle {
                    pre_stop: Some(LifecycleHandler {
                        exec: Some(ExecAction {
                            command: Some(command.into_iter().map(str::to_string).collect()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn min_availability_invocation_parses_to_seconds() {
        let (has_dc_util, timeout) =
            check_decommission_utility("/dc_util-linux -min-availability PRIMARIES -timeout 15m");
        assert!(has_dc_util);
        assert_eq!(timeout, 900);
    }

    #[test]
    fn timeout_units_multiply() {
        assert_eq!(check_decommission_utility("dc_util -t 90"), (true, 90));
        assert_eq!(check_decommission_utility("dc_util -t 90s"), (true, 90));
        assert_eq!(check_decommission_utility("dc_util --timeout=5m"), (true, 300));
        assert_eq!(check_decommission_utility("dc_util --timeout 2h"), (true, 7200));
    }

    #[test]
    fn missing_timeout_defaults() {
        assert_eq!(
            check_decommission_utility("dc-util --min-availability FULL"),
            (true, DEFAULT_DC_UTIL_TIMEOUT)
        );
    }

    #[test]
    fn non_decommission_commands_are_ignored() {
        assert_eq!(
            check_decommission_utility("sleep 30 && curl -X POST localhost/drain"),
            (false, DEFAULT_DC_UTIL_TIMEOUT)
        );
    }

    #[test]
    fn all_signatures_are_recognized() {
        for signature in DECOMMISSION_SIGNATURES {
            let command = format!("{signature} -t 60");
            assert!(
                check_decommission_utility(&command).0,
                "signature {signature} not recognized"
            );
        }
    }

    #[test]
    fn shell_wrapper_is_unwrapped() {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "/dc_util-linux-amd64 -t 720s".to_string(),
        ];
        assert_eq!(extract_shell_command(&command), "/dc_util-linux-amd64 -t 720s");

        let bare = vec!["dc_util".to_string(), "-t".to_string(), "60".to_string()];
        assert_eq!(extract_shell_command(&bare), "dc_util -t 60");
    }

    #[test]
    fn prestop_analysis_reads_crate_container_only() {
        let spec = pod_spec_with_prestop("crate", vec!["/bin/sh", "-c", "/dc_util -t 10m"]);
        let info = analyze_prestop_hook(&spec);
        assert!(info.has_prestop_hook);
        assert!(info.has_dc_util);
        assert_eq!(info.dc_util_timeout, 600);

        let other = pod_spec_with_prestop("sidecar", vec!["/bin/sh", "-c", "/dc_util -t 10m"]);
        let info = analyze_prestop_hook(&other);
        assert!(!info.has_prestop_hook);
        assert!(!info.has_dc_util);
        assert_eq!(info.dc_util_timeout, DEFAULT_DC_UTIL_TIMEOUT);
    }

    #[test]
    fn prestop_without_decommission_utility() {
        let spec = pod_spec_with_prestop("crate", vec!["/bin/sh", "-c", "sleep 30"]);
        let info = analyze_prestop_hook(&spec);
        assert!(info.has_prestop_hook);
        assert!(!info.has_dc_util);
    }
}
