//! Effect activities: the only place that touches Kubernetes or the
//! database. Each activity does one thing, may be re-invoked at any time,
//! and reports liveness through its [`ActivityContext`]. Failures are
//! classified; the policy table decides what is retried.

pub mod decommission;
pub mod discovery;
pub mod health;
pub mod nodes;
pub mod pods;
pub mod routing;

use async_trait::async_trait;
use chrono::Utc;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::{info, warn};

use crate::engine::ActivityContext;
use crate::error::ActivityError;
use crate::maintenance::{MaintenanceConfig, MaintenanceConfigError};
use crate::types::{
    ClusterDiscoveryInput, ClusterDiscoveryResult, ClusterValidationInput, ClusterValidationResult,
    DecommissionInput, DecommissionResult, HealthCheckInput, HealthCheckResult,
    MaintenanceWindowCheckInput, MaintenanceWindowCheckResult, PodRestartInput, RoutingResetInput,
    RoutingResetResult,
};

/// The activity seam the workflow layer is written against. The worker binds
/// it to [`KubeActivities`]; tests bind it to scripted fakes.
#[async_trait]
pub trait Activities: Send + Sync {
    async fn discover_clusters(
        &self,
        ctx: ActivityContext,
        input: ClusterDiscoveryInput,
    ) -> Result<ClusterDiscoveryResult, ActivityError>;

    async fn validate_cluster(
        &self,
        ctx: ActivityContext,
        input: ClusterValidationInput,
    ) -> Result<ClusterValidationResult, ActivityError>;

    async fn check_cluster_health(
        &self,
        ctx: ActivityContext,
        input: HealthCheckInput,
    ) -> Result<HealthCheckResult, ActivityError>;

    async fn check_maintenance_window(
        &self,
        ctx: ActivityContext,
        input: MaintenanceWindowCheckInput,
    ) -> Result<MaintenanceWindowCheckResult, ActivityError>;

    async fn decommission_pod(
        &self,
        ctx: ActivityContext,
        input: DecommissionInput,
    ) -> Result<DecommissionResult, ActivityError>;

    async fn delete_pod(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError>;

    async fn wait_for_pod_ready(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError>;

    async fn reset_cluster_routing_allocation(
        &self,
        ctx: ActivityContext,
        input: RoutingResetInput,
    ) -> Result<RoutingResetResult, ActivityError>;

    async fn is_pod_on_suspended_node(
        &self,
        ctx: ActivityContext,
        pod_name: String,
        namespace: String,
    ) -> Result<bool, ActivityError>;
}

/// Activities backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeActivities {
    client: kube::Client,
}

impl KubeActivities {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Client for one call, honoring an explicit kubeconfig/context override.
    async fn client_for(
        &self,
        kubeconfig: Option<&str>,
        context: Option<&str>,
    ) -> Result<kube::Client, ActivityError> {
        if kubeconfig.is_none() && context.is_none() {
            return Ok(self.client.clone());
        }
        make_kube_client(kubeconfig, context).await
    }
}

/// Build a client from an explicit kubeconfig path and/or context, falling
/// back to the inferred environment configuration.
pub async fn make_kube_client(
    kubeconfig: Option<&str>,
    context: Option<&str>,
) -> Result<kube::Client, ActivityError> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = if let Some(path) = kubeconfig {
        let file = Kubeconfig::read_from(path).map_err(|err| {
            ActivityError::Configuration(format!("failed to read kubeconfig {path}: {err}"))
        })?;
        kube::Config::from_custom_kubeconfig(file, &options)
            .await
            .map_err(|err| {
                ActivityError::Configuration(format!("invalid kubeconfig {path}: {err}"))
            })?
    } else if context.is_some() {
        kube::Config::from_kubeconfig(&options).await.map_err(|err| {
            ActivityError::Configuration(format!("failed to load kube context: {err}"))
        })?
    } else {
        kube::Config::infer().await.map_err(|err| {
            ActivityError::Configuration(format!("failed to infer kube config: {err}"))
        })?
    };
    config
        .try_into()
        .map_err(|err: kube::Error| ActivityError::Configuration(format!("{err}")))
}

#[async_trait]
impl Activities for KubeActivities {
    async fn discover_clusters(
        &self,
        ctx: ActivityContext,
        input: ClusterDiscoveryInput,
    ) -> Result<ClusterDiscoveryResult, ActivityError> {
        let client = self
            .client_for(input.kubeconfig.as_deref(), input.context.as_deref())
            .await?;
        discovery::discover_clusters(&client, ctx, &input).await
    }

    async fn validate_cluster(
        &self,
        _ctx: ActivityContext,
        input: ClusterValidationInput,
    ) -> Result<ClusterValidationResult, ActivityError> {
        Ok(validate_cluster(&input))
    }

    async fn check_cluster_health(
        &self,
        ctx: ActivityContext,
        input: HealthCheckInput,
    ) -> Result<HealthCheckResult, ActivityError> {
        health::check_cluster_health(&self.client, ctx, &input).await
    }

    async fn check_maintenance_window(
        &self,
        _ctx: ActivityContext,
        input: MaintenanceWindowCheckInput,
    ) -> Result<MaintenanceWindowCheckResult, ActivityError> {
        Ok(check_maintenance_window(&input))
    }

    async fn decommission_pod(
        &self,
        ctx: ActivityContext,
        input: DecommissionInput,
    ) -> Result<DecommissionResult, ActivityError> {
        decommission::decommission_pod(&self.client, ctx, &input).await
    }

    async fn delete_pod(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError> {
        pods::delete_pod(&self.client, ctx, &input).await
    }

    async fn wait_for_pod_ready(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError> {
        pods::wait_for_pod_ready(&self.client, ctx, &input).await
    }

    async fn reset_cluster_routing_allocation(
        &self,
        ctx: ActivityContext,
        input: RoutingResetInput,
    ) -> Result<RoutingResetResult, ActivityError> {
        routing::reset_cluster_routing_allocation(&self.client, ctx, &input).await
    }

    async fn is_pod_on_suspended_node(
        &self,
        _ctx: ActivityContext,
        pod_name: String,
        namespace: String,
    ) -> Result<bool, ActivityError> {
        nodes::is_pod_on_suspended_node(&self.client, &pod_name, &namespace).await
    }
}

/// Caps how many activities run at once on this worker. Excess invocations
/// queue on the semaphore, which is what throttles a busy orchestrator.
pub struct ThrottledActivities {
    inner: std::sync::Arc<dyn Activities>,
    slots: std::sync::Arc<tokio::sync::Semaphore>,
}

impl ThrottledActivities {
    pub fn new(inner: std::sync::Arc<dyn Activities>, max_concurrent: usize) -> Self {
        Self {
            inner,
            slots: std::sync::Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1))),
        }
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.slots.acquire().await.expect("semaphore never closed")
    }
}

#[async_trait]
impl Activities for ThrottledActivities {
    async fn discover_clusters(
        &self,
        ctx: ActivityContext,
        input: ClusterDiscoveryInput,
    ) -> Result<ClusterDiscoveryResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.discover_clusters(ctx, input).await
    }

    async fn validate_cluster(
        &self,
        ctx: ActivityContext,
        input: ClusterValidationInput,
    ) -> Result<ClusterValidationResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.validate_cluster(ctx, input).await
    }

    async fn check_cluster_health(
        &self,
        ctx: ActivityContext,
        input: HealthCheckInput,
    ) -> Result<HealthCheckResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.check_cluster_health(ctx, input).await
    }

    async fn check_maintenance_window(
        &self,
        ctx: ActivityContext,
        input: MaintenanceWindowCheckInput,
    ) -> Result<MaintenanceWindowCheckResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.check_maintenance_window(ctx, input).await
    }

    async fn decommission_pod(
        &self,
        ctx: ActivityContext,
        input: DecommissionInput,
    ) -> Result<DecommissionResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.decommission_pod(ctx, input).await
    }

    async fn delete_pod(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError> {
        let _permit = self.permit().await;
        self.inner.delete_pod(ctx, input).await
    }

    async fn wait_for_pod_ready(
        &self,
        ctx: ActivityContext,
        input: PodRestartInput,
    ) -> Result<(), ActivityError> {
        let _permit = self.permit().await;
        self.inner.wait_for_pod_ready(ctx, input).await
    }

    async fn reset_cluster_routing_allocation(
        &self,
        ctx: ActivityContext,
        input: RoutingResetInput,
    ) -> Result<RoutingResetResult, ActivityError> {
        let _permit = self.permit().await;
        self.inner.reset_cluster_routing_allocation(ctx, input).await
    }

    async fn is_pod_on_suspended_node(
        &self,
        ctx: ActivityContext,
        pod_name: String,
        namespace: String,
    ) -> Result<bool, ActivityError> {
        let _permit = self.permit().await;
        self.inner
            .is_pod_on_suspended_node(ctx, pod_name, namespace)
            .await
    }
}

/// Validate a cluster before restart. A suspended cluster is the only hard
/// error; everything else is a warning for the operator.
pub fn validate_cluster(input: &ClusterValidationInput) -> ClusterValidationResult {
    let cluster = &input.cluster;
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    if cluster.suspended {
        errors.push("Cluster is SUSPENDED".to_string());
    }

    if !cluster.health.is_green() {
        warnings.push(format!("Cluster health is {}, not GREEN", cluster.health));
    }

    if !input.skip_hook_warning {
        if !cluster.has_prestop_hook {
            warnings.push("No prestop hook detected".to_string());
        } else if !cluster.has_dc_util {
            warnings
                .push("Prestop hook detected but no decommissioning utility found".to_string());
        }
    }

    ClusterValidationResult {
        cluster_name: cluster.name.clone(),
        is_valid: errors.is_empty(),
        warnings,
        errors,
    }
}

/// Maintenance-window decision. Missing or broken configuration degrades to
/// "proceed" so an infrastructure problem cannot brick the restart.
pub fn check_maintenance_window(
    input: &MaintenanceWindowCheckInput,
) -> MaintenanceWindowCheckResult {
    let now = input.current_time.unwrap_or_else(Utc::now);

    let Some(config_path) = input.config_path.as_deref() else {
        return MaintenanceWindowCheckResult {
            cluster_name: input.cluster_name.clone(),
            should_wait: false,
            reason: "No maintenance configuration path provided - proceeding without restrictions"
                .to_string(),
            next_window_start: None,
            current_time: now,
            in_maintenance_window: false,
        };
    };

    match MaintenanceConfig::load(config_path) {
        Ok(config) => {
            let result = config.check(&input.cluster_name, now);
            if result.should_wait {
                warn!(
                    cluster = %input.cluster_name,
                    reason = %result.reason,
                    "outside maintenance window - restart delayed"
                );
            } else {
                info!(cluster = %input.cluster_name, reason = %result.reason, "maintenance window check");
            }
            result
        }
        Err(err @ MaintenanceConfigError::NotFound(_)) => {
            warn!(error = %err, "maintenance config missing - proceeding without restrictions");
            MaintenanceWindowCheckResult {
                cluster_name: input.cluster_name.clone(),
                should_wait: false,
                reason: format!(
                    "Maintenance config file not found - proceeding without restrictions: {err}"
                ),
                next_window_start: None,
                current_time: now,
                in_maintenance_window: false,
            }
        }
        Err(err) => {
            warn!(error = %err, "maintenance window check failed - proceeding");
            MaintenanceWindowCheckResult {
                cluster_name: input.cluster_name.clone(),
                should_wait: false,
                reason: format!(
                    "Error checking maintenance windows - proceeding with restart: {err}"
                ),
                next_window_start: None,
                current_time: now,
                in_maintenance_window: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrateDBCluster, Health, MinAvailability};

    fn cluster() -> CrateDBCluster {
        CrateDBCluster {
            name: "c1".to_string(),
            namespace: "ns".to_string(),
            statefulset_name: "crate-c1".to_string(),
            health: Health::Green,
            replicas: 3,
            pods: vec!["crate-c1-0".to_string()],
            has_prestop_hook: true,
            has_dc_util: true,
            suspended: false,
            crd_name: "c1".to_string(),
            dc_util_timeout: 720,
            min_availability: MinAvailability::Primaries,
        }
    }

    #[test]
    fn suspended_cluster_fails_validation() {
        let mut input = ClusterValidationInput {
            cluster: cluster(),
            skip_hook_warning: false,
        };
        input.cluster.suspended = true;
        let result = validate_cluster(&input);
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["Cluster is SUSPENDED".to_string()]);
    }

    #[test]
    fn non_green_and_missing_hooks_warn_only() {
        let mut input = ClusterValidationInput {
            cluster: cluster(),
            skip_hook_warning: false,
        };
        input.cluster.health = Health::Yellow;
        input.cluster.has_prestop_hook = false;
        input.cluster.has_dc_util = false;
        let result = validate_cluster(&input);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].contains("YELLOW"));
        assert!(result.warnings[1].contains("prestop"));
    }

    #[test]
    fn hook_warnings_can_be_skipped() {
        let mut input = ClusterValidationInput {
            cluster: cluster(),
            skip_hook_warning: true,
        };
        input.cluster.has_prestop_hook = false;
        let result = validate_cluster(&input);
        assert!(result.is_valid);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn prestop_without_util_warns() {
        let mut input = ClusterValidationInput {
            cluster: cluster(),
            skip_hook_warning: false,
        };
        input.cluster.has_dc_util = false;
        let result = validate_cluster(&input);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("no decommissioning utility"));
    }

    #[test]
    fn maintenance_check_without_config_path_proceeds() {
        let result = check_maintenance_window(&MaintenanceWindowCheckInput {
            cluster_name: "c1".to_string(),
            current_time: Some(Utc::now()),
            config_path: None,
        });
        assert!(!result.should_wait);
        assert!(result.reason.contains("No maintenance configuration path"));
    }

    #[test]
    fn maintenance_check_fails_open_on_missing_file() {
        let result = check_maintenance_window(&MaintenanceWindowCheckInput {
            cluster_name: "c1".to_string(),
            current_time: Some(Utc::now()),
            config_path: Some("/nonexistent/maintenance.toml".to_string()),
        });
        assert!(!result.should_wait);
        assert!(result.reason.contains("not found"));
    }
}
