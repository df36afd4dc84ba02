//! Persistence interface
//!
//! The orchestrator only ever touches the document store through these
//! shapes; any store that can answer them can back the orchestrator.

mod file_store;

use async_trait::async_trait;
use uuid::Uuid;

use crate::credentials::Credentials;
use crate::environment::Environment;
use crate::message::TaskMessage;
use crate::task::{Task, TaskStatus, TaskUpdate};
use crate::usage::UsageRecord;
use crate::Result;

pub use file_store::FileStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Get a task by ID
    async fn find_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// Merge the given fields into a task document and return the result
    async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task>;

    /// Move a task from `from` to `to` atomically.
    ///
    /// Fails with [`crate::Error::InvalidState`] when the stored status is not
    /// `from`, so at most one caller can claim a task.
    async fn transition_task(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<Task>;

    /// Append one entry to a task's transcript
    async fn append_task_message(&self, message: TaskMessage) -> Result<()>;

    /// The earliest user message of a task (the original prompt)
    async fn find_first_user_message(&self, task_id: Uuid) -> Result<Option<TaskMessage>>;

    /// A task's transcript in creation order
    async fn list_task_messages(&self, task_id: Uuid) -> Result<Vec<TaskMessage>>;

    /// Tasks with a container reference whose container outcome is not yet known
    async fn find_tasks_awaiting_container_outcome(&self) -> Result<Vec<Task>>;

    async fn find_environment(&self, id: Uuid) -> Result<Option<Environment>>;

    async fn find_user_credentials(&self, user_id: Uuid) -> Result<Option<Credentials>>;

    /// Append a usage/cost entry
    async fn record_usage(&self, record: UsageRecord) -> Result<()>;
}
