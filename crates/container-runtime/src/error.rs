//! Error types for container runtime operations

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while talking to a container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Runtime daemon or cluster is unreachable
    #[error("Container runtime unavailable: {reason}")]
    Unavailable { reason: String },

    /// Failed to create or start a container
    #[error("Container creation failed: {reason}")]
    ContainerCreationFailed { reason: String },

    /// Failed to run a command inside a container
    #[error("Exec failed: {reason}")]
    ExecFailed { reason: String },

    /// Container does not exist
    #[error("Container not found: {id}")]
    NotFound { id: String },

    /// Bounded wait elapsed
    #[error("Timed out after {seconds} seconds waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    /// Docker API error
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Create an ExecFailed error
    pub fn exec_failed(reason: impl Into<String>) -> Self {
        Self::ExecFailed {
            reason: reason.into(),
        }
    }

    /// Create a ContainerCreationFailed error
    pub fn creation_failed(reason: impl Into<String>) -> Self {
        Self::ContainerCreationFailed {
            reason: reason.into(),
        }
    }

    /// Whether the error means the runtime itself is unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
