use serde::Deserialize;

fn default_listen_addr() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_max_concurrent_activities() -> usize {
    5
}

/// Worker configuration, parsed from `CONF_`-prefixed environment
/// variables.
#[derive(Deserialize, Clone, Debug)]
pub struct WorkerConfig {
    /// Listen address of the worker HTTP API.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// How many workflow runs may execute at once; the rest queue.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// How many activities may execute at once across all workflows.
    #[serde(default = "default_max_concurrent_activities")]
    pub max_concurrent_activities: usize,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONF_").from_env()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_activities: default_max_concurrent_activities(),
        }
    }
}

/// Default worker endpoint the CLI talks to.
pub const DEFAULT_WORKER_URL: &str = "http://127.0.0.1:7420";
