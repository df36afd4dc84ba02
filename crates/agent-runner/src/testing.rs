//! Scripted fakes for orchestration tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agentbox_core::{
    Credentials, Environment, FileStore, GithubIdentity, ProviderKind, Task, TaskMessage, TaskStore,
};
use async_trait::async_trait;
use container_runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest,
    OutputLine, OutputStream, Result as RuntimeResult, RuntimeError, RuntimeKind,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::Result;
use crate::github::{NewPullRequest, PullRequest, SourceHost};
use crate::provisioner::READY_SENTINEL;

#[derive(Default)]
struct RuntimeState {
    available: bool,
    containers: HashMap<String, ContainerInfo>,
    created: Vec<ContainerSpec>,
    requests: Vec<ExecRequest>,
    removed: Vec<String>,
    logs: HashMap<String, String>,
}

/// In-memory container runtime answering exec requests from a script.
///
/// The first response whose needle occurs in the command wins; commands
/// without a match succeed with empty output.
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    responses: Vec<(String, ExecOutput)>,
    boot_logs: String,
    pause: Option<Pause>,
}

/// Holds the first exec whose command contains `needle` until resumed
struct Pause {
    needle: String,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                available: true,
                ..Default::default()
            }),
            responses: Vec::new(),
            boot_logs: format!("booting\n{}\n", READY_SENTINEL),
            pause: None,
        }
    }

    pub fn pause_on(mut self, needle: &str) -> Self {
        self.pause = Some(Pause {
            needle: needle.to_string(),
            armed: AtomicBool::new(true),
            reached: Notify::new(),
            release: Notify::new(),
        });
        self
    }

    /// Wait until the paused command has been issued
    pub async fn paused(&self) {
        if let Some(pause) = &self.pause {
            pause.reached.notified().await;
        }
    }

    pub fn resume(&self) {
        if let Some(pause) = &self.pause {
            pause.release.notify_one();
        }
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(info) = self.state.lock().unwrap().containers.get_mut(id) {
            info.status = status;
            info.state = status.as_str().to_string();
        }
    }

    pub fn respond(mut self, needle: &str, stdout: &str, exit_code: i64) -> Self {
        self.responses.push((
            needle.to_string(),
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 { String::new() } else { format!("{} failed", needle) },
                exit_code,
            },
        ));
        self
    }

    pub fn with_boot_logs(mut self, logs: &str) -> Self {
        self.boot_logs = logs.to_string();
        self
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    pub fn add_container(&self, id: &str, status: ContainerStatus) {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            ContainerInfo {
                id: id.to_string(),
                name: format!("agentbox-{}", id),
                status,
                state: status.as_str().to_string(),
                labels,
                created_at: None,
            },
        );
    }

    pub fn set_logs(&self, id: &str, logs: &str) {
        self.state.lock().unwrap().logs.insert(id.to_string(), logs.to_string());
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.command).collect()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(id)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let id = format!("fake-{}", spec.name);
        {
            let mut state = self.state.lock().unwrap();
            state.created.push(spec.clone());
            state.logs.insert(id.clone(), self.boot_logs.clone());
        }
        self.add_container(&id, ContainerStatus::Running);
        Ok(id)
    }

    async fn run_exec(
        &self,
        _container_id: &str,
        request: &ExecRequest,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> RuntimeResult<ExecOutput> {
        self.state.lock().unwrap().requests.push(request.clone());
        let pause = self.pause.as_ref().filter(|p| {
            request.command.contains(&p.needle) && p.armed.swap(false, Ordering::SeqCst)
        });
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.release.notified().await;
        }
        let output = self
            .responses
            .iter()
            .find(|(needle, _)| request.command.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();

        if let Some(tx) = lines {
            for line in output.stdout.lines() {
                let _ = tx.send(OutputLine {
                    stream: OutputStream::Stdout,
                    line: line.to_string(),
                });
            }
        }
        Ok(output)
    }

    async fn stop_container(&self, container_id: &str) -> RuntimeResult<()> {
        if let Some(info) = self.state.lock().unwrap().containers.get_mut(container_id) {
            info.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(container_id);
        state.removed.push(container_id.to_string());
        Ok(())
    }

    async fn container_info(&self, container_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        Ok(self.state.lock().unwrap().containers.get(container_id).cloned())
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerInfo>> {
        let state = self.state.lock().unwrap();
        let mut containers: Vec<ContainerInfo> = state
            .containers
            .values()
            .filter(|c| all || c.status.is_running())
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn container_logs(&self, container_id: &str, _tail: usize) -> RuntimeResult<String> {
        let state = self.state.lock().unwrap();
        match state.logs.get(container_id) {
            Some(logs) => Ok(logs.clone()),
            None if state.containers.contains_key(container_id) => Ok(String::new()),
            None => Err(RuntimeError::NotFound {
                id: container_id.to_string(),
            }),
        }
    }
}

/// Source host with a fixed token and recorded pull requests
pub struct FakeSourceHost {
    token: Option<String>,
    mergeable: Option<bool>,
    created: Mutex<Vec<NewPullRequest>>,
    merged: Mutex<Vec<u64>>,
}

impl FakeSourceHost {
    pub fn with_token(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            mergeable: Some(true),
            created: Mutex::new(Vec::new()),
            merged: Mutex::new(Vec::new()),
        }
    }

    pub fn without_access() -> Self {
        Self {
            token: None,
            ..Self::with_token("")
        }
    }

    pub fn mergeable(mut self, mergeable: Option<bool>) -> Self {
        self.mergeable = mergeable;
        self
    }

    pub fn created(&self) -> Vec<NewPullRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn merged(&self) -> Vec<u64> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceHost for FakeSourceHost {
    async fn repository_token(&self, _installation_ids: &[u64], _repository: &str) -> Result<Option<String>> {
        Ok(self.token.clone())
    }

    fn clone_url(&self, repository_full_name: &str, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("https://x-access-token:{}@github.com/{}.git", token, repository_full_name),
            None => format!("https://github.com/{}.git", repository_full_name),
        }
    }

    async fn create_pull_request(&self, _token: &str, repository: &str, pull: &NewPullRequest) -> Result<PullRequest> {
        let mut created = self.created.lock().unwrap();
        created.push(pull.clone());
        let number = created.len() as u64;
        Ok(PullRequest {
            number,
            html_url: format!("https://github.com/{}/pull/{}", repository, number),
            state: "open".to_string(),
            mergeable: None,
            merged: false,
        })
    }

    async fn get_pull_request(&self, _token: &str, repository: &str, number: u64) -> Result<PullRequest> {
        Ok(PullRequest {
            number,
            html_url: format!("https://github.com/{}/pull/{}", repository, number),
            state: "open".to_string(),
            mergeable: self.mergeable,
            merged: false,
        })
    }

    async fn merge_pull_request(&self, _token: &str, _repository: &str, number: u64, _title: &str) -> Result<bool> {
        self.merged.lock().unwrap().push(number);
        Ok(true)
    }
}

/// A file store seeded with one user, environment and pending task
pub struct Fixture {
    _dir: TempDir,
    pub store: Arc<FileStore>,
    pub environment: Environment,
    pub task: Task,
}

impl Fixture {
    pub async fn new(provider: ProviderKind) -> Self {
        Self::build(provider, |task| task).await
    }

    pub async fn build(provider: ProviderKind, configure: impl FnOnce(Task) -> Task) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let user_id = Uuid::new_v4();

        let environment = Environment::new(user_id, "widgets", "acme/widgets", provider);
        store.put_environment(environment.clone()).await.unwrap();

        let mut credentials = Credentials::new(user_id);
        credentials.anthropic_api_key = Some("sk-ant-test".to_string());
        credentials.claude_oauth_token = Some("oauth-test".to_string());
        credentials.gemini_api_key = Some("gemini-test".to_string());
        credentials.codex_oauth_json = Some("{\"tokens\":{}}".to_string());
        credentials.github = GithubIdentity {
            installation_ids: vec![42],
            name: Some("Ada".to_string()),
            email: Some("ada@example.com".to_string()),
        };
        store.put_credentials(credentials).await.unwrap();

        let task = configure(Task::new(user_id, environment.id, "Fix the sum"));
        let task = store.insert_task(task).await.unwrap();
        store
            .append_task_message(TaskMessage::user(task.id, "Fix the sign error in a.py"))
            .await
            .unwrap();

        Self {
            _dir: dir,
            store,
            environment,
            task,
        }
    }

    /// Replace the stored environment
    pub async fn update_environment(&mut self, configure: impl FnOnce(&mut Environment)) {
        configure(&mut self.environment);
        self.store.put_environment(self.environment.clone()).await.unwrap();
    }

    pub async fn messages(&self) -> Vec<TaskMessage> {
        self.store.list_task_messages(self.task.id).await.unwrap()
    }
}
