//! The runtime capability interface

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{ContainerInfo, ContainerSpec, ExecOutput, ExecRequest, OutputLine, RuntimeKind};

/// Label carried by every container this system creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "agentbox";
/// Label linking a container back to its task
pub const TASK_ID_LABEL: &str = "agentbox.dev/task-id";

/// Build a DNS-1123 compatible container name for a task
pub fn container_name(task_id: &str) -> String {
    let short: String = task_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}-{}-{}", MANAGED_BY_VALUE, short, suffix)
}

/// Container lifecycle operations, implemented once per backend
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> RuntimeKind;

    /// Liveness probe of the daemon or cluster
    async fn is_available(&self) -> bool;

    /// Create and start a container, returning its runtime handle.
    ///
    /// Returns once the runtime reports the container started (Docker) or
    /// running with all containers ready (Kubernetes).
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Run a command; every complete output line is forwarded to `lines`
    /// as soon as it is read, when a sender is given.
    async fn run_exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<ExecOutput>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Remove a container. Removing a container that no longer exists succeeds.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Current state, or `None` if the container does not exist
    async fn container_info(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    /// Managed containers only; `all = false` restricts to running ones
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Last `tail` lines of the container's own output
    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// Run a command and collect its output
    async fn execute(&self, container_id: &str, request: &ExecRequest) -> Result<ExecOutput> {
        self.run_exec(container_id, request, None).await
    }

    /// Run a command, streaming its output lines into `lines`
    async fn execute_streaming(
        &self,
        container_id: &str,
        request: &ExecRequest,
        lines: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ExecOutput> {
        self.run_exec(container_id, request, Some(lines)).await
    }

    /// Remove every managed container that is not running
    async fn cleanup_containers(&self) -> Result<usize> {
        let containers = self.list_containers(true).await?;
        let mut removed = 0;

        for container in containers.iter().filter(|c| !c.status.is_running()) {
            match self.remove_container(&container.id, true).await {
                Ok(()) => {
                    info!(
                        "Removed {} container {} ({})",
                        container.status.as_str(),
                        container.name,
                        container.id
                    );
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove container {}: {}", container.id, e),
            }
        }

        Ok(removed)
    }
}
