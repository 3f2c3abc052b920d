use std::time::Duration;

use thiserror::Error;

use crate::types::Health;

/// Abstract failure kinds used by the retry policy table to decide whether an
/// activity invocation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Configuration,
    Validation,
    ResourceNotFound,
    PodNotFound,
    Transient,
    HealthNotGreen,
    Cancelled,
}

/// Errors raised by effect activities. Every variant maps onto one
/// [`ErrorKind`]; retryability is decided per operation class in
/// [`crate::policy`], not here.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("pod not found: {0}")]
    PodNotFound(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("cluster health is {health}, expected GREEN")]
    HealthNotGreen { health: Health },
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ActivityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            Self::PodNotFound(_) => ErrorKind::PodNotFound,
            Self::Transient(_) => ErrorKind::Transient,
            Self::HealthNotGreen { .. } => ErrorKind::HealthNotGreen,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Last observed health symbol, for `HealthNotGreen` failures.
    pub fn health(&self) -> Option<Health> {
        match self {
            Self::HealthNotGreen { health } => Some(*health),
            _ => None,
        }
    }
}

/// Failures surfaced by the workflow layer after the engine has applied the
/// policy table (retries exhausted, non-retryable error, timeout, or
/// cancellation).
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),
    #[error("workflow cancelled")]
    Cancelled,
}

impl WorkflowError {
    /// Health symbol carried by a failed health gate, if any.
    pub fn health(&self) -> Option<Health> {
        match self {
            Self::Activity(err) => err.health(),
            _ => None,
        }
    }
}

/// Classify a Kubernetes API error into the activity taxonomy.
///
/// 401 is a credentials problem and non-retryable; expired cloud tokens get
/// an actionable hint. 404 means the referenced object is gone. Everything
/// else (timeouts, 5xx, connection resets) is transient.
pub fn classify_kube_error(context: &str, err: &kube::Error) -> ActivityError {
    match err {
        kube::Error::Api(resp) => {
            let msg = format!("{context}: {} ({})", resp.message, resp.code);
            if resp.code == 401 {
                ActivityError::Configuration(credentials_hint(&msg))
            } else if resp.code == 404 {
                ActivityError::ResourceNotFound(msg)
            } else if resp.code == 403 {
                ActivityError::Configuration(msg)
            } else {
                ActivityError::Transient(msg)
            }
        }
        kube::Error::Auth(auth) => {
            ActivityError::Configuration(credentials_hint(&format!("{context}: {auth}")))
        }
        other => {
            let msg = format!("{context}: {other}");
            if msg.contains("ExpiredToken") || msg.contains("security token") {
                ActivityError::Configuration(credentials_hint(&msg))
            } else {
                ActivityError::Transient(msg)
            }
        }
    }
}

fn credentials_hint(msg: &str) -> String {
    if msg.contains("ExpiredToken") || msg.contains("security token") {
        format!("{msg}. Your cloud session token appears to be expired; refresh your credentials (e.g. re-run your SSO login) and retry")
    } else {
        format!("{msg}. Check kubeconfig/context and credentials")
    }
}
