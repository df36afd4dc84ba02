//! Task model definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle status of a task
///
/// The only legal path is `pending -> running -> {completed | failed}`.
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Check if the status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One agent run against one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub environment_id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    /// Runtime handle of the task's container, set once provisioned
    #[serde(default)]
    pub container_id: Option<String>,
    /// Whether the container reached a terminal runtime state
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub auto_merge: bool,
    /// Names of the environment's MCP servers selected for this task
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default)]
    pub pr: Option<String>,
    #[serde(default)]
    pub merged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    pub fn new(user_id: Uuid, environment_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            environment_id,
            title: title.into(),
            status: TaskStatus::default(),
            container_id: None,
            executed: false,
            error: None,
            plan_mode: false,
            auto_merge: false,
            mcp_servers: Vec::new(),
            pr: None,
            merged: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enable plan mode
    pub fn with_plan_mode(mut self, plan_mode: bool) -> Self {
        self.plan_mode = plan_mode;
        self
    }

    /// Enable auto-merge of the opened pull request
    pub fn with_auto_merge(mut self, auto_merge: bool) -> Self {
        self.auto_merge = auto_merge;
        self
    }

    /// Select MCP servers for this task
    pub fn with_mcp_servers(mut self, servers: Vec<String>) -> Self {
        self.mcp_servers = servers;
        self
    }

    /// Apply a field-level update.
    ///
    /// Every field present in the update overwrites the stored value, except
    /// `status`, which is only applied when the transition is legal.
    pub fn apply(&mut self, update: TaskUpdate) {
        if let Some(status) = update.status.filter(|s| *s != self.status) {
            if self.status.can_transition_to(status) {
                self.status = status;
            } else {
                warn!(
                    "Ignoring illegal status transition {} -> {} for task {}",
                    self.status.as_str(),
                    status.as_str(),
                    self.id
                );
            }
        }
        if let Some(container_id) = update.container_id {
            self.container_id = container_id;
        }
        if let Some(executed) = update.executed {
            self.executed = executed;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(pr) = update.pr {
            self.pr = Some(pr);
        }
        if let Some(merged) = update.merged {
            self.merged = merged;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a task document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub container_id: Option<Option<String>>,
    pub executed: Option<bool>,
    pub error: Option<Option<String>>,
    pub pr: Option<String>,
    pub merged: Option<bool>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(Some(container_id.into()));
        self
    }

    pub fn clear_container(mut self) -> Self {
        self.container_id = Some(None);
        self
    }

    pub fn executed(mut self, executed: bool) -> Self {
        self.executed = Some(executed);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn pr(mut self, url: impl Into<String>) -> Self {
        self.pr = Some(url.into());
        self
    }

    pub fn merged(mut self, merged: bool) -> Self {
        self.merged = Some(merged);
        self
    }
}
