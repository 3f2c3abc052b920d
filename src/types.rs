use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health symbol reported by the CrateDB custom resource status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    Green,
    Yellow,
    Red,
    #[default]
    Unknown,
    Unreachable,
}

impl Health {
    /// A cluster is healthy iff the symbol is exactly GREEN.
    pub fn is_green(self) -> bool {
        matches!(self, Self::Green)
    }

    /// Parse the raw status string found on the custom resource. Anything
    /// unrecognized maps to UNKNOWN.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "GREEN" => Self::Green,
            "YELLOW" => Self::Yellow,
            "RED" => Self::Red,
            "UNREACHABLE" => Self::Unreachable,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Green => write!(f, "GREEN"),
            Self::Yellow => write!(f, "YELLOW"),
            Self::Red => write!(f, "RED"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Availability floor the decommission protocol must preserve.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MinAvailability {
    #[default]
    Primaries,
    None,
    Full,
}

impl MinAvailability {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PRIMARIES" => Some(Self::Primaries),
            "NONE" => Some(Self::None),
            "FULL" => Some(Self::Full),
            _ => None,
        }
    }
}

impl fmt::Display for MinAvailability {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Primaries => write!(f, "PRIMARIES"),
            Self::None => write!(f, "NONE"),
            Self::Full => write!(f, "FULL"),
        }
    }
}

/// Default drain-timeout budget for the decommission utility, in seconds.
pub const DEFAULT_DC_UTIL_TIMEOUT: u64 = 720;

/// One discovered CrateDB cluster. Immutable within a restart run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CrateDBCluster {
    /// Cluster name (`spec.cluster.name`, falling back to the CR name).
    pub name: String,
    pub namespace: String,
    pub statefulset_name: String,
    /// Health observed at discovery time.
    pub health: Health,
    pub replicas: i32,
    /// Member pod names, in restart order.
    #[serde(default)]
    pub pods: Vec<String>,
    #[serde(default)]
    pub has_prestop_hook: bool,
    /// The pre-stop hook runs the decommission utility itself.
    #[serde(default)]
    pub has_dc_util: bool,
    /// Replicas scaled to zero.
    #[serde(default)]
    pub suspended: bool,
    /// Name of the governing `cratedbs.cloud.crate.io` resource.
    pub crd_name: String,
    #[serde(default = "default_dc_util_timeout")]
    pub dc_util_timeout: u64,
    #[serde(default)]
    pub min_availability: MinAvailability,
}

fn default_dc_util_timeout() -> u64 {
    DEFAULT_DC_UTIL_TIMEOUT
}

/// Report rendering requested by the operator.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

/// Per-run restart options.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RestartOptions {
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_hook_warning: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bound on a recreated pod becoming Ready, in seconds.
    #[serde(default = "default_ready_timeout")]
    pub pod_ready_timeout: u64,
    #[serde(default = "default_ready_timeout")]
    pub health_check_timeout: u64,
    #[serde(default)]
    pub maintenance_config_path: Option<String>,
    #[serde(default)]
    pub ignore_maintenance_windows: bool,
    /// Restrict the run to pods scheduled on suspended nodes.
    #[serde(default)]
    pub only_on_suspended_nodes: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ready_timeout() -> u64 {
    300
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PodRestartInput {
    pub pod_name: String,
    pub namespace: String,
    pub cluster: CrateDBCluster,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_ready_timeout")]
    pub pod_ready_timeout: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PodRestartResult {
    pub pod_name: String,
    pub namespace: String,
    pub success: bool,
    /// Seconds, non-negative.
    pub duration: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate record of one cluster restart, including partial progress.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RestartResult {
    pub cluster: CrateDBCluster,
    pub success: bool,
    pub duration: f64,
    #[serde(default)]
    pub restarted_pods: Vec<String>,
    #[serde(default)]
    pub skipped_pods: Vec<String>,
    pub total_pods: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stopped early by a graceful `cancel_restart` signal.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthCheckInput {
    pub cluster: CrateDBCluster,
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds the caller is prepared to wait for GREEN.
    #[serde(default = "default_ready_timeout")]
    pub timeout: u64,
}

/// Single health observation. Ephemeral; never persisted between polls.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthCheckResult {
    pub cluster_name: String,
    pub health: Health,
    pub is_healthy: bool,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn observed(cluster_name: &str, health: Health, checked_at: DateTime<Utc>) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            health,
            is_healthy: health.is_green(),
            checked_at: Some(checked_at),
            error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MaintenanceWindowCheckInput {
    pub cluster_name: String,
    #[serde(default)]
    pub current_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MaintenanceWindowCheckResult {
    pub cluster_name: String,
    pub should_wait: bool,
    pub reason: String,
    #[serde(default)]
    pub next_window_start: Option<DateTime<Utc>>,
    pub current_time: DateTime<Utc>,
    #[serde(default)]
    pub in_maintenance_window: bool,
}

/// Decommission strategy, a pure function of `cluster.has_dc_util`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecommissionStrategy {
    /// The pre-stop hook runs the utility; deletion triggers it.
    KubernetesManaged,
    /// Five-statement SQL protocol executed inside the pod.
    Manual,
}

impl fmt::Display for DecommissionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::KubernetesManaged => write!(f, "kubernetes_managed"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DecommissionInput {
    pub pod_name: String,
    pub namespace: String,
    pub cluster: CrateDBCluster,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DecommissionResult {
    pub pod_name: String,
    pub namespace: String,
    pub strategy: DecommissionStrategy,
    pub success: bool,
    pub duration: f64,
    #[serde(default)]
    pub error: Option<String>,
    /// Manual strategy only: the database process was observed to exit.
    #[serde(default)]
    pub process_exited: bool,
    pub timeout: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoutingResetInput {
    pub pod_name: String,
    pub namespace: String,
    pub cluster: CrateDBCluster,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RoutingResetResult {
    pub pod_name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub success: bool,
    pub duration: f64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterValidationInput {
    pub cluster: CrateDBCluster,
    #[serde(default)]
    pub skip_hook_warning: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterValidationResult {
    pub cluster_name: String,
    pub is_valid: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterDiscoveryInput {
    /// Restrict discovery to these cluster names; `None` discovers all.
    #[serde(default)]
    pub cluster_names: Option<Vec<String>>,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub maintenance_config_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterDiscoveryResult {
    #[serde(default)]
    pub clusters: Vec<CrateDBCluster>,
    pub total_found: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MultiRestartInput {
    /// `None` restarts every discovered cluster.
    #[serde(default)]
    pub cluster_names: Option<Vec<String>>,
    pub options: RestartOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MultiRestartResult {
    #[serde(default)]
    pub results: Vec<RestartResult>,
    pub total_clusters: usize,
    pub successful_clusters: usize,
    pub failed_clusters: usize,
    pub total_duration: f64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Live status of a cluster restart, exposed via the status query.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ClusterRestartStatus {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub current_pod: Option<String>,
    #[serde(default)]
    pub pods_completed: Vec<String>,
    #[serde(default)]
    pub skipped_pods: Vec<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub force_restart_active: bool,
}
