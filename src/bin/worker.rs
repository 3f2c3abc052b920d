use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use rotor::activities::{Activities, KubeActivities, ThrottledActivities};
use rotor::api::{create_app, ApiState};
use rotor::config::WorkerConfig;
use rotor::engine::registry::WorkflowRegistry;

/// Generate future that awaits shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = WorkerConfig::from_env().context("failed to parse config from env")?;

    let kube_config = kube::Config::infer()
        .await
        .context("failed to infer Kubernetes config")?;
    let client: kube::Client = kube_config
        .try_into()
        .context("failed to make Kubernetes client")?;

    let kube_activities: Arc<dyn Activities> = Arc::new(KubeActivities::new(client));
    let activities: Arc<dyn Activities> = Arc::new(ThrottledActivities::new(
        kube_activities,
        config.max_concurrent_activities,
    ));
    let registry = WorkflowRegistry::new(activities.clone(), config.max_concurrent_workflows);

    let identity = hostname::get()
        .context("failed to read hostname")?
        .to_string_lossy()
        .to_string();

    let state = Arc::new(ApiState {
        registry,
        activities,
        identity,
    });
    let app = create_app(state);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr))?;
    tracing::info!(%addr, "rotor worker listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("worker server failed")?;

    Ok(())
}
