//! HTTP client the CLI uses to talk to the worker.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

use crate::engine::registry::{WorkflowDetail, WorkflowSummary};
use crate::engine::signals::SignalRequest;
use crate::types::{ClusterDiscoveryInput, ClusterDiscoveryResult, MultiRestartInput};

/// How often a synchronous `restart` polls the workflow for completion.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct WorkerClient {
    base: Url,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("invalid worker url: {base_url}"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { base, http })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid path {path}"))
    }

    pub async fn discover(&self, input: &ClusterDiscoveryInput) -> Result<ClusterDiscoveryResult> {
        let response = self
            .http
            .post(self.url("/discover")?)
            .json(input)
            .send()
            .await
            .context("failed to reach worker; is rotor-worker running?")?;
        Self::parse(response).await
    }

    pub async fn start_restart(&self, input: &MultiRestartInput) -> Result<WorkflowSummary> {
        let response = self
            .http
            .post(self.url("/workflows/restart")?)
            .json(input)
            .send()
            .await
            .context("failed to reach worker; is rotor-worker running?")?;
        Self::parse(response).await
    }

    pub async fn get_workflow(&self, id: &str) -> Result<WorkflowDetail> {
        let response = self
            .http
            .get(self.url(&format!("/workflows/{id}"))?)
            .send()
            .await
            .context("failed to reach worker")?;
        Self::parse(response).await
    }

    pub async fn list_workflows(&self, limit: usize) -> Result<Vec<WorkflowSummary>> {
        let response = self
            .http
            .get(self.url(&format!("/workflows?limit={limit}"))?)
            .send()
            .await
            .context("failed to reach worker")?;
        Self::parse(response).await
    }

    pub async fn signal(&self, id: &str, request: &SignalRequest) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workflows/{id}/signal"))?)
            .json(request)
            .send()
            .await
            .context("failed to reach worker")?;
        Self::check(response).await
    }

    pub async fn terminate(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/workflows/{id}/terminate"))?)
            .send()
            .await
            .context("failed to reach worker")?;
        Self::check(response).await
    }

    /// Poll a workflow until it leaves the running state.
    pub async fn wait_for_completion(&self, id: &str) -> Result<WorkflowDetail> {
        loop {
            let detail = self.get_workflow(id).await?;
            if detail.summary.state != crate::engine::registry::WorkflowState::Running {
                return Ok(detail);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("worker returned {status}: {body}");
        }
        response
            .json()
            .await
            .context("failed to decode worker response")
    }

    async fn check(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("worker returned {status}: {body}");
        }
        Ok(())
    }
}
