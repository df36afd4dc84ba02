//! Runtime-neutral container and exec types

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code reported when a command is killed for exceeding its ceiling
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Which backend a runtime talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Docker,
    Kubernetes,
}

impl RuntimeKind {
    /// Parse runtime kind from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "kubernetes" | "k8s" => Some(Self::Kubernetes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

/// CPU and memory caps for a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpu_cores: Option<f64>,
    pub memory_mb: Option<u64>,
}

/// Everything needed to create a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    /// Extra labels; the managed-by label is always added by the runtime
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceLimits,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            working_dir: "/workspace".to_string(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            resources: ResourceLimits::default(),
        }
    }
}

/// A command to run inside an existing container
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Shell command, run through `bash`
    pub command: String,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Caller-imposed ceiling; runtimes may apply their own on top
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One complete line of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Result of a finished exec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// Synthetic result for a command killed at its ceiling
    pub fn timeout(stdout: String, stderr: String, after: Duration) -> Self {
        let mut stderr = stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Command timed out after {} seconds", after.as_secs()));
        Self {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }

    /// Stderr if present, otherwise stdout, trimmed
    pub fn error_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Normalized container state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Pending,
    /// Scheduled but stuck (image pull failure, crash loop, bad config)
    PendingAbnormal,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Succeeded,
    Failed,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Map a Docker state string (`running`, `exited`, ...)
    pub fn from_docker_state(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// The container finished on its own
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited | Self::Succeeded | Self::Failed)
    }

    /// The container is gone or stuck in a way it will not recover from
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Dead | Self::Removing | Self::PendingAbnormal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::PendingAbnormal => "pending_abnormal",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

/// Snapshot of a container as the runtime reports it
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    /// Raw state text from the runtime
    pub state: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}
