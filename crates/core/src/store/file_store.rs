//! File-based store implementation
//!
//! Directory structure:
//! ```text
//! .agentbox-data/
//!   tasks.json          # Task documents
//!   environments.json   # Environment documents
//!   credentials.json    # Credential documents
//!   messages.jsonl      # Task messages (newline-delimited JSON, append-only)
//!   usage.jsonl         # Usage records (newline-delimited JSON, append-only)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::TaskStore;
use crate::credentials::Credentials;
use crate::environment::Environment;
use crate::message::{MessageRole, TaskMessage};
use crate::task::{Task, TaskStatus, TaskUpdate};
use crate::usage::UsageRecord;
use crate::{Error, Result};

/// File-based document store using JSON
pub struct FileStore {
    data_dir: PathBuf,
    tasks: RwLock<HashMap<Uuid, Task>>,
    environments: RwLock<HashMap<Uuid, Environment>>,
    credentials: RwLock<HashMap<Uuid, Credentials>>,
    /// Messages grouped by task, in append order
    messages: RwLock<HashMap<Uuid, Vec<TaskMessage>>>,
    /// Serializes appends to the JSONL logs
    append_lock: Mutex<()>,
    /// Serializes snapshot writes of the JSON documents
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `data_dir`
    ///
    /// Missing files are created on first write.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();

        let tasks: Vec<Task> = load_documents(&data_dir.join("tasks.json")).await?;
        let environments: Vec<Environment> =
            load_documents(&data_dir.join("environments.json")).await?;
        let credentials: Vec<Credentials> =
            load_documents(&data_dir.join("credentials.json")).await?;
        let message_log: Vec<TaskMessage> = load_lines(&data_dir.join("messages.jsonl")).await?;

        let mut messages: HashMap<Uuid, Vec<TaskMessage>> = HashMap::new();
        for message in message_log {
            messages.entry(message.task_id).or_default().push(message);
        }

        Ok(Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id, t)).collect()),
            environments: RwLock::new(environments.into_iter().map(|e| (e.id, e)).collect()),
            credentials: RwLock::new(credentials.into_iter().map(|c| (c.user_id, c)).collect()),
            messages: RwLock::new(messages),
            append_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Insert a new task
    pub async fn insert_task(&self, task: Task) -> Result<Task> {
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&task.id) {
                return Err(Error::InvalidInput(format!(
                    "Task with ID {} already exists",
                    task.id
                )));
            }
            tasks.insert(task.id, task.clone());
        }
        self.persist_tasks().await?;
        Ok(task)
    }

    /// Insert or replace an environment
    pub async fn put_environment(&self, environment: Environment) -> Result<()> {
        {
            let mut environments = self.environments.write().await;
            environments.insert(environment.id, environment);
        }
        let _guard = self.persist_lock.lock().await;
        let environments = self.environments.read().await;
        write_documents(&self.data_dir.join("environments.json"), environments.values()).await
    }

    /// Insert or replace a user's credentials
    pub async fn put_credentials(&self, credentials: Credentials) -> Result<()> {
        {
            let mut all = self.credentials.write().await;
            all.insert(credentials.user_id, credentials);
        }
        let _guard = self.persist_lock.lock().await;
        let all = self.credentials.read().await;
        write_documents(&self.data_dir.join("credentials.json"), all.values()).await
    }

    /// Read back all usage records
    pub async fn list_usage(&self) -> Result<Vec<UsageRecord>> {
        load_lines(&self.data_dir.join("usage.jsonl")).await
    }

    async fn persist_tasks(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let tasks = self.tasks.read().await;
        write_documents(&self.data_dir.join("tasks.json"), tasks.values()).await
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(file))
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn find_task(&self, id: Uuid) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id).cloned())
    }

    async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task> {
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            task.apply(update);
            task.clone()
        };
        self.persist_tasks().await?;
        debug!("Updated task {} (status {})", id, updated.status.as_str());
        Ok(updated)
    }

    async fn transition_task(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<Task> {
        let updated = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
            if task.status != from || !from.can_transition_to(to) {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    status: task.status.as_str().to_string(),
                    expected: from.as_str().to_string(),
                });
            }
            task.apply(TaskUpdate::new().status(to));
            task.clone()
        };
        self.persist_tasks().await?;
        debug!("Task {} moved {} -> {}", id, from.as_str(), to.as_str());
        Ok(updated)
    }

    async fn append_task_message(&self, message: TaskMessage) -> Result<()> {
        self.append_line("messages.jsonl", &message).await?;
        let mut messages = self.messages.write().await;
        messages.entry(message.task_id).or_default().push(message);
        Ok(())
    }

    async fn find_first_user_message(&self, task_id: Uuid) -> Result<Option<TaskMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .get(&task_id)
            .and_then(|log| log.iter().find(|m| m.role == MessageRole::User))
            .cloned())
    }

    async fn list_task_messages(&self, task_id: Uuid) -> Result<Vec<TaskMessage>> {
        let messages = self.messages.read().await;
        Ok(messages.get(&task_id).cloned().unwrap_or_default())
    }

    async fn find_tasks_awaiting_container_outcome(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| t.container_id.is_some() && !t.executed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn find_environment(&self, id: Uuid) -> Result<Option<Environment>> {
        let environments = self.environments.read().await;
        Ok(environments.get(&id).cloned())
    }

    async fn find_user_credentials(&self, user_id: Uuid) -> Result<Option<Credentials>> {
        let credentials = self.credentials.read().await;
        Ok(credentials.get(&user_id).cloned())
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.append_line("usage.jsonl", &record).await
    }
}

async fn load_documents<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

async fn load_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path).await?;
    let mut values = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => values.push(value),
            Err(e) => warn!("Skipping malformed line {} in {}: {}", index + 1, path.display(), e),
        }
    }
    Ok(values)
}

async fn write_documents<'a, T, I>(path: &Path, values: I) -> Result<()>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let values: Vec<&T> = values.collect();
    let content = serde_json::to_string_pretty(&values)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Readers never see a half-written file
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}
