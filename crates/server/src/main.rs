//! Agentbox server
//!
//! Bootstraps the store, the container runtime and the orchestration
//! components, runs the health monitor and serves the HTTP trigger API.

mod config;
mod routes;
mod state;

use std::sync::Arc;

use agent_runner::{
    ContainerProvisioner, ExecutionEngine, GithubClient, HealthMonitor, PullRequestPublisher,
    SourceHost, TaskWorkflow,
};
use agentbox_core::{FileStore, TaskStore};
use anyhow::Context;
use container_runtime::{ContainerRuntime, DockerRuntime, KubernetesRuntime, RuntimeKind};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "agentbox_server=debug,agent_runner=debug,container_runtime=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Using data directory: {:?}", config.data_dir);

    let store: Arc<dyn TaskStore> = Arc::new(
        FileStore::open(&config.data_dir)
            .await
            .context("Failed to open the task store")?,
    );

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Docker => Arc::new(
            DockerRuntime::connect()
                .await
                .context("Failed to connect to Docker")?,
        ),
        RuntimeKind::Kubernetes => Arc::new(
            KubernetesRuntime::connect(config.kubernetes.clone())
                .await
                .context("Failed to connect to Kubernetes")?,
        ),
    };
    tracing::info!("Container runtime: {}", runtime.kind().as_str());

    if config.github_app.is_none() {
        tracing::warn!("GITHUB_APP_ID is not set; repositories cannot be cloned or published");
    }
    let source_host: Arc<dyn SourceHost> = Arc::new(GithubClient::new(config.github_app.clone()));

    let provisioner = Arc::new(ContainerProvisioner::new(
        runtime.clone(),
        store.clone(),
        source_host.clone(),
        config.provisioner.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(runtime.clone(), store.clone()));
    let publisher = Arc::new(PullRequestPublisher::new(
        runtime.clone(),
        store.clone(),
        source_host,
        config.publisher.clone(),
    ));
    let workflow = Arc::new(TaskWorkflow::new(
        store.clone(),
        runtime.clone(),
        provisioner,
        engine,
        publisher,
    ));
    let monitor = Arc::new(HealthMonitor::new(
        runtime.clone(),
        store.clone(),
        config.monitor.clone(),
    ));

    if config.cleanup_on_start {
        match monitor.cleanup_orphaned_containers().await {
            Ok(removed) => tracing::info!("Startup cleanup removed {} containers", removed),
            Err(e) => tracing::warn!("Startup cleanup failed: {}", e),
        }
    }
    let monitor_handle = Arc::clone(&monitor).start();

    let app = routes::router()
        .with_state(AppState::new(store, runtime, workflow, monitor))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!("HTTP API listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor_handle.shutdown().await;
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
