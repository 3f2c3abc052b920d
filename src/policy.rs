use std::time::Duration;

use crate::error::ErrorKind;
use crate::types::CrateDBCluster;

/// Closed registry of operation classes. Every activity invocation resolves
/// its timeout and retry bounds here; nothing retries outside this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    HealthCheck,
    Decommission,
    PodOperations,
    ApiCalls,
    MaintenanceCheck,
    RoutingReset,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    pub backoff_coefficient: f64,
    pub non_retryable: &'static [ErrorKind],
}

impl RetryPolicy {
    /// Whether a failure of `kind` may be retried under this policy.
    /// Cancellation cuts through every class.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind != ErrorKind::Cancelled && !self.non_retryable.contains(&kind)
    }
}

#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub class: OperationClass,
    pub start_to_close: Duration,
    /// Liveness bound: an attempt with no heartbeat for this long is failed
    /// as transient. Activities beat at intervals of at most half of this.
    pub heartbeat_timeout: Duration,
    pub retry: RetryPolicy,
}

impl OperationClass {
    pub fn options(self) -> ActivityOptions {
        match self {
            Self::HealthCheck => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(600),
                heartbeat_timeout: Duration::from_secs(30),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(5),
                    maximum_interval: Duration::from_secs(30),
                    maximum_attempts: 30,
                    backoff_coefficient: 2.0,
                    non_retryable: &[ErrorKind::Configuration, ErrorKind::Validation],
                },
            },
            Self::Decommission => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(900),
                heartbeat_timeout: Duration::from_secs(30),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(10),
                    maximum_interval: Duration::from_secs(60),
                    maximum_attempts: 3,
                    backoff_coefficient: 2.0,
                    non_retryable: &[
                        ErrorKind::Configuration,
                        ErrorKind::Validation,
                        ErrorKind::PodNotFound,
                        ErrorKind::Cancelled,
                    ],
                },
            },
            Self::PodOperations => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(300),
                heartbeat_timeout: Duration::from_secs(30),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(5),
                    maximum_interval: Duration::from_secs(30),
                    maximum_attempts: 5,
                    backoff_coefficient: 2.0,
                    non_retryable: &[
                        ErrorKind::ResourceNotFound,
                        ErrorKind::Validation,
                        ErrorKind::Cancelled,
                    ],
                },
            },
            Self::ApiCalls => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(30),
                heartbeat_timeout: Duration::from_secs(10),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(1),
                    maximum_interval: Duration::from_secs(10),
                    maximum_attempts: 3,
                    backoff_coefficient: 2.0,
                    non_retryable: &[
                        ErrorKind::Configuration,
                        ErrorKind::Validation,
                        ErrorKind::Cancelled,
                    ],
                },
            },
            Self::MaintenanceCheck => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(30),
                heartbeat_timeout: Duration::from_secs(10),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(1),
                    maximum_interval: Duration::from_secs(10),
                    maximum_attempts: 3,
                    backoff_coefficient: 2.0,
                    non_retryable: &[ErrorKind::Configuration, ErrorKind::Cancelled],
                },
            },
            Self::RoutingReset => ActivityOptions {
                class: self,
                start_to_close: Duration::from_secs(60),
                heartbeat_timeout: Duration::from_secs(15),
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(5),
                    maximum_interval: Duration::from_secs(15),
                    maximum_attempts: 2,
                    backoff_coefficient: 2.0,
                    non_retryable: &[
                        ErrorKind::Configuration,
                        ErrorKind::Validation,
                        ErrorKind::Cancelled,
                    ],
                },
            },
        }
    }
}

/// Decommission options for a concrete cluster: the drain budget extends the
/// start-to-close bound, and the Kubernetes-managed strategy gets one fewer
/// attempt (the second delete would re-trigger the pre-stop hook).
pub fn decommission_options(cluster: &CrateDBCluster) -> ActivityOptions {
    let mut opts = OperationClass::Decommission.options();
    opts.start_to_close = Duration::from_secs(cluster.dc_util_timeout + 120);
    if cluster.has_dc_util {
        opts.retry.maximum_attempts = 2;
    }
    opts
}

/// Pod-ready wait options bounded by the caller's `pod_ready_timeout`.
pub fn wait_ready_options(pod_ready_timeout: u64) -> ActivityOptions {
    let mut opts = OperationClass::PodOperations.options();
    opts.start_to_close = Duration::from_secs(pod_ready_timeout);
    opts
}

/// Discovery walks every namespace, so it gets a wider start-to-close bound
/// than ordinary API calls.
pub fn discovery_options() -> ActivityOptions {
    let mut opts = OperationClass::ApiCalls.options();
    opts.start_to_close = Duration::from_secs(120);
    opts.retry.initial_interval = Duration::from_secs(2);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Health, MinAvailability};

    fn cluster(has_dc_util: bool, dc_util_timeout: u64) -> CrateDBCluster {
        CrateDBCluster {
            name: "c".to_string(),
            namespace: "ns".to_string(),
            statefulset_name: "crate-c".to_string(),
            health: Health::Green,
            replicas: 1,
            pods: vec!["crate-c-0".to_string()],
            has_prestop_hook: has_dc_util,
            has_dc_util,
            suspended: false,
            crd_name: "c".to_string(),
            dc_util_timeout,
            min_availability: MinAvailability::Primaries,
        }
    }

    #[test]
    fn health_check_policy_matches_table() {
        let opts = OperationClass::HealthCheck.options();
        assert_eq!(opts.start_to_close, Duration::from_secs(600));
        assert_eq!(opts.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(opts.retry.initial_interval, Duration::from_secs(5));
        assert_eq!(opts.retry.maximum_interval, Duration::from_secs(30));
        assert_eq!(opts.retry.maximum_attempts, 30);
    }

    #[test]
    fn decommission_start_to_close_tracks_drain_budget() {
        let opts = decommission_options(&cluster(false, 720));
        assert_eq!(opts.start_to_close, Duration::from_secs(840));
        let opts = decommission_options(&cluster(false, 900));
        assert_eq!(opts.start_to_close, Duration::from_secs(1020));
    }

    #[test]
    fn kubernetes_managed_decommission_gets_fewer_attempts() {
        assert_eq!(decommission_options(&cluster(true, 720)).retry.maximum_attempts, 2);
        assert_eq!(decommission_options(&cluster(false, 720)).retry.maximum_attempts, 3);
    }

    #[test]
    fn cancellation_is_never_retryable() {
        for class in [
            OperationClass::HealthCheck,
            OperationClass::Decommission,
            OperationClass::PodOperations,
            OperationClass::ApiCalls,
            OperationClass::MaintenanceCheck,
            OperationClass::RoutingReset,
        ] {
            assert!(!class.options().retry.is_retryable(ErrorKind::Cancelled));
        }
    }

    #[test]
    fn health_gate_retries_non_green_observations() {
        let opts = OperationClass::HealthCheck.options();
        assert!(opts.retry.is_retryable(ErrorKind::HealthNotGreen));
        assert!(opts.retry.is_retryable(ErrorKind::Transient));
        assert!(!opts.retry.is_retryable(ErrorKind::Configuration));
        assert!(!opts.retry.is_retryable(ErrorKind::Validation));
    }

    #[test]
    fn pod_operations_fail_fast_on_missing_resources() {
        let opts = OperationClass::PodOperations.options();
        assert!(!opts.retry.is_retryable(ErrorKind::ResourceNotFound));
        assert!(opts.retry.is_retryable(ErrorKind::Transient));
    }

    #[test]
    fn wait_ready_is_bounded_by_caller_timeout() {
        assert_eq!(
            wait_ready_options(450).start_to_close,
            Duration::from_secs(450)
        );
    }
}
