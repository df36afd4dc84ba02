//! Error types for agent-runner

use container_runtime::RuntimeError;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while running a task
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Task not found
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Task is not in a state the operation accepts
    #[error("Task {task_id} is {status}, expected pending")]
    InvalidState { task_id: String, status: String },

    /// Environment not found
    #[error("Environment not found: {environment_id}")]
    EnvironmentNotFound { environment_id: String },

    /// User has no credential set at all
    #[error("No credentials stored for user {user_id}")]
    CredentialsNotFound { user_id: String },

    /// The environment's provider has no credential configured
    #[error("No credential configured for provider {provider}")]
    MissingCredential { provider: String },

    /// No GitHub App installation grants access to the repository
    #[error("No GitHub installation grants access to {repository}")]
    NoRepositoryAccess { repository: String },

    /// The task has no user prompt to run
    #[error("Task {task_id} has no prompt")]
    PromptNotFound { task_id: String },

    /// A command inside the container exited non-zero
    #[error("{step} failed with exit code {exit_code}: {output}")]
    ProcessFailed {
        step: String,
        exit_code: i64,
        output: String,
    },

    /// Source-host API call failed
    #[error("Source host error: {message}")]
    SourceHost { message: String },

    /// Container runtime error
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Document store error
    #[error("Store error: {0}")]
    Store(#[from] agentbox_core::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ExecutorError {
    /// Create a ProcessFailed error
    pub fn process_failed(step: impl Into<String>, exit_code: i64, output: impl Into<String>) -> Self {
        Self::ProcessFailed {
            step: step.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Create a SourceHost error
    pub fn source_host(message: impl Into<String>) -> Self {
        Self::SourceHost {
            message: message.into(),
        }
    }

    /// Missing setup on the user's side; retrying without changes won't help
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential { .. }
                | Self::NoRepositoryAccess { .. }
                | Self::EnvironmentNotFound { .. }
                | Self::CredentialsNotFound { .. }
        )
    }
}
