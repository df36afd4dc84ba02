//! Container runtime abstraction
//!
//! This crate normalizes Docker and Kubernetes into one container
//! lifecycle interface: create, exec (buffered or line-streamed),
//! inspect, list, logs, stop, remove and managed-container cleanup.

mod docker;
mod error;
mod kubernetes;
mod output;
mod runtime;
mod shell;
mod types;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use kubernetes::{KubernetesConfig, KubernetesRuntime};
pub use output::OutputCollector;
pub use runtime::{
    container_name, ContainerRuntime, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TASK_ID_LABEL,
};
pub use shell::{redact_tokens, shell_quote};
pub use types::{
    ContainerInfo, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, OutputLine,
    OutputStream, ResourceLimits, RuntimeKind, TIMEOUT_EXIT_CODE,
};
