//! Task workflow
//!
//! Drives one task through `pending -> running -> {completed | failed}`:
//! provision, configure, execute, publish. The container is cleaned up
//! whatever the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentbox_core::{MessageType, Task, TaskMessage, TaskStatus, TaskStore, TaskUpdate};
use container_runtime::{redact_tokens, ContainerRuntime, ExecRequest};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::error::{ExecutorError, Result};
use crate::exec::run_step;
use crate::provisioner::{default_runtime_versions, ContainerProvisioner};
use crate::publisher::{PublishOutcome, PullRequestPublisher};

/// Label of the main agent invocation in usage records
const EXECUTE_LABEL: &str = "execute";

pub struct TaskWorkflow {
    store: Arc<dyn TaskStore>,
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<ContainerProvisioner>,
    engine: Arc<ExecutionEngine>,
    publisher: Arc<PullRequestPublisher>,
}

impl TaskWorkflow {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<ContainerProvisioner>,
        engine: Arc<ExecutionEngine>,
        publisher: Arc<PullRequestPublisher>,
    ) -> Self {
        Self {
            store,
            runtime,
            provisioner,
            engine,
            publisher,
        }
    }

    /// Run a pending task to a terminal status.
    ///
    /// Errors are only returned when the task cannot be started (unknown or
    /// not pending) or its terminal status could not be stored; failures of
    /// the run itself end as [`TaskStatus::Failed`].
    pub async fn run_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        let task = self.claim_task(task_id).await?;
        self.run_claimed(task).await
    }

    /// Move a pending task to running. Only one caller can claim a task.
    pub async fn claim_task(&self, task_id: Uuid) -> Result<Task> {
        let task = self
            .store
            .transition_task(task_id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .map_err(|e| match e {
                agentbox_core::Error::TaskNotFound(_) => ExecutorError::TaskNotFound {
                    task_id: task_id.to_string(),
                },
                agentbox_core::Error::InvalidState { status, .. } => ExecutorError::InvalidState {
                    task_id: task_id.to_string(),
                    status,
                },
                other => other.into(),
            })?;
        info!("Task {} ({}) is running", task.id, task.title);
        Ok(task)
    }

    /// Drive a task claimed with [`TaskWorkflow::claim_task`] to its end.
    ///
    /// The returned status is the one stored, which may already have been
    /// set by the health monitor.
    pub async fn run_claimed(&self, task: Task) -> Result<TaskStatus> {
        let recorded = match self.execute(&task).await {
            Ok(outcome) => {
                info!("Task {} completed: {:?}", task.id, outcome);
                self.store
                    .update_task(
                        task.id,
                        TaskUpdate::new().status(TaskStatus::Completed).executed(true),
                    )
                    .await
                    .map(|stored| stored.status)
                    .map_err(ExecutorError::from)
            }
            Err(e) => {
                let message = redact_tokens(&e.to_string());
                error!("Task {} failed: {}", task.id, message);
                self.record_failure(task.id, &message).await
            }
        };

        self.cleanup(task.id).await;
        recorded
    }

    async fn execute(&self, task: &Task) -> Result<PublishOutcome> {
        let provisioned = self
            .provisioner
            .setup_container(task.id, &default_runtime_versions(), &BTreeMap::new())
            .await?;
        let container_id = provisioned.container_id.as_str();
        let workspace = provisioned.workspace_dir.as_str();

        let environment = self
            .store
            .find_environment(task.environment_id)
            .await?
            .ok_or_else(|| ExecutorError::EnvironmentNotFound {
                environment_id: task.environment_id.to_string(),
            })?;

        if let Some(script) = environment
            .configuration_script
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            info!("Running configuration script for task {}", task.id);
            let request = ExecRequest::new(script).in_dir(workspace);
            run_step(self.runtime.as_ref(), container_id, &request, "configuration script").await?;
        }

        let prompt = self
            .store
            .find_first_user_message(task.id)
            .await?
            .ok_or_else(|| ExecutorError::PromptNotFound {
                task_id: task.id.to_string(),
            })?;

        let summary = self
            .engine
            .execute_and_persist(ExecutionRequest {
                container_id,
                prompt: &prompt.content,
                workdir: workspace,
                provider: environment.provider,
                model: environment.model.as_deref(),
                task,
                label: EXECUTE_LABEL,
            })
            .await?;

        self.publisher
            .create_from_changes(container_id, task, &summary)
            .await
    }

    async fn record_failure(&self, task_id: Uuid, message: &str) -> Result<TaskStatus> {
        let stored = self
            .store
            .update_task(
                task_id,
                TaskUpdate::new()
                    .status(TaskStatus::Failed)
                    .executed(true)
                    .error(message),
            )
            .await?;
        self.store
            .append_task_message(TaskMessage::tagged(
                task_id,
                MessageType::Error,
                format!("Task failed: {}", message),
            ))
            .await?;
        Ok(stored.status)
    }

    /// Stop and remove the task's container; failures only produce a warning
    async fn cleanup(&self, task_id: Uuid) {
        // The monitor may already have collected the container
        let container_id = match self.store.find_task(task_id).await {
            Ok(task) => task.and_then(|t| t.container_id),
            Err(e) => {
                warn!("Could not load task {} for cleanup: {}", task_id, e);
                None
            }
        };
        let Some(container_id) = container_id else {
            return;
        };

        if let Err(e) = self.runtime.stop_container(&container_id).await {
            debug!("Stopping container {} failed: {}", container_id, e);
        }
        let removed = match self.runtime.remove_container(&container_id, true).await {
            Ok(()) => self
                .store
                .update_task(task_id, TaskUpdate::new().clear_container())
                .await
                .map(|_| ())
                .map_err(ExecutorError::from),
            Err(e) => Err(e.into()),
        };

        match removed {
            Ok(()) => info!("Cleaned up container {} of task {}", container_id, task_id),
            Err(e) => {
                warn!("Cleanup of container {} failed: {}", container_id, e);
                let warning = TaskMessage::tagged(
                    task_id,
                    MessageType::Warning,
                    format!("Container {} could not be cleaned up: {}", container_id, e),
                );
                if let Err(e) = self.store.append_task_message(warning).await {
                    warn!("Failed to record cleanup warning for task {}: {}", task_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::SourceHost;
    use crate::monitor::{HealthMonitor, MonitorConfig};
    use crate::provisioner::ProvisionerConfig;
    use crate::publisher::PublisherConfig;
    use crate::testing::{FakeRuntime, FakeSourceHost, Fixture};
    use agentbox_core::ProviderKind;
    use container_runtime::ContainerStatus;
    use std::time::Duration;

    const EDIT_RUN: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Edit","input":{"file_path":"/a.py","old_string":"a - b","new_string":"a + b"}}]}}
{"type":"result","subtype":"success","result":"Fixed the sign.","total_cost_usd":0.02}"#;

    fn workflow(fixture: &Fixture, runtime: &Arc<FakeRuntime>, host: FakeSourceHost) -> TaskWorkflow {
        let host: Arc<dyn SourceHost> = Arc::new(host);
        let provisioner = ContainerProvisioner::new(
            runtime.clone(),
            fixture.store.clone(),
            host.clone(),
            ProvisionerConfig::default(),
        );
        let engine = ExecutionEngine::new(runtime.clone(), fixture.store.clone());
        let publisher = PullRequestPublisher::new(
            runtime.clone(),
            fixture.store.clone(),
            host,
            PublisherConfig {
                auto_merge_delay: Duration::ZERO,
                ..Default::default()
            },
        );
        TaskWorkflow::new(
            fixture.store.clone(),
            runtime.clone(),
            Arc::new(provisioner),
            Arc::new(engine),
            Arc::new(publisher),
        )
    }

    #[tokio::test]
    async fn test_successful_run_completes_and_cleans_up() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond("claude -p", EDIT_RUN, 0)
                .respond("git status --porcelain", " M a.py\n", 0),
        );

        let status = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"))
            .run_task(fixture.task.id)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.executed);
        assert!(task.container_id.is_none());
        assert_eq!(task.pr.as_deref(), Some("https://github.com/acme/widgets/pull/1"));
        assert_eq!(runtime.removed().len(), 1);

        let messages = fixture.messages().await;
        let tools: Vec<_> = messages.iter().filter(|m| m.is_type(MessageType::ToolCall)).collect();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].content.contains("/a.py"));

        let usage = fixture.store.list_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].cost_usd, 0.02);
    }

    #[tokio::test]
    async fn test_agent_failure_fails_task_and_cleans_up() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", "", 1));

        let status = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"))
            .run_task(fixture.task.id)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("execute failed with exit code 1"));
        assert!(task.container_id.is_none());
        assert_eq!(runtime.removed().len(), 1);

        let messages = fixture.messages().await;
        assert!(messages.iter().any(|m| m.is_type(MessageType::Error)));
    }

    #[tokio::test]
    async fn test_configuration_script_failure() {
        let mut fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        fixture
            .update_environment(|env| env.configuration_script = Some("make setup".into()))
            .await;
        let runtime = Arc::new(FakeRuntime::new().respond("make setup", "", 2));

        let status = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"))
            .run_task(fixture.task.id)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert!(!runtime.ran("claude -p"));

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert!(task.error.as_deref().unwrap().starts_with("configuration script failed"));
    }

    #[tokio::test]
    async fn test_missing_repository_access_fails() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new());

        let status = workflow(&fixture, &runtime, FakeSourceHost::without_access())
            .run_task(fixture.task.id)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert!(task.error.as_deref().unwrap().contains("acme/widgets"));
        // The container was created before the clone failed
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_no_changes_counts_as_completed() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", EDIT_RUN, 0));

        let status = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"))
            .run_task(fixture.task.id)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert!(task.pr.is_none());
        assert!(!runtime.ran("git push"));
    }

    #[tokio::test]
    async fn test_only_pending_tasks_run() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", EDIT_RUN, 0));
        let workflow = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"));

        workflow.run_task(fixture.task.id).await.unwrap();
        let err = workflow.run_task(fixture.task.id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidState { .. }));

        let err = workflow.run_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::TaskNotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_provision_one_container() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", EDIT_RUN, 0));
        let workflow = Arc::new(workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token")));

        let task_id = fixture.task.id;
        let first = tokio::spawn({
            let workflow = workflow.clone();
            async move { workflow.run_task(task_id).await }
        });
        let second = tokio::spawn({
            let workflow = workflow.clone();
            async move { workflow.run_task(task_id).await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let completed = results
            .iter()
            .filter(|r| matches!(r, Ok(TaskStatus::Completed)))
            .count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(ExecutorError::InvalidState { .. })))
            .count();
        assert_eq!((completed, rejected), (1, 1));
        assert_eq!(runtime.created_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_task_rejects_running_task() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new());
        let workflow = workflow(&fixture, &runtime, FakeSourceHost::with_token("ghs_token"));

        let task = workflow.claim_task(fixture.task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        let err = workflow.claim_task(fixture.task.id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Task {} is running, expected pending", fixture.task.id)
        );
        assert!(runtime.created_specs().is_empty());
    }

    /// Runs the workflow until the agent command is issued, lets the monitor
    /// see the container in `status`, then lets the workflow finish.
    async fn run_with_monitor_cycle(
        fixture: &Fixture,
        status: ContainerStatus,
    ) -> (TaskStatus, Arc<FakeRuntime>, String) {
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond("claude -p", EDIT_RUN, 0)
                .respond("git status --porcelain", " M a.py\n", 0)
                .pause_on("claude -p"),
        );
        let workflow = Arc::new(workflow(fixture, &runtime, FakeSourceHost::with_token("ghs_token")));
        let monitor = HealthMonitor::new(runtime.clone(), fixture.store.clone(), MonitorConfig::default());

        let task_id = fixture.task.id;
        let run = tokio::spawn({
            let workflow = workflow.clone();
            async move { workflow.run_task(task_id).await }
        });

        runtime.paused().await;
        let container_id = fixture
            .store
            .find_task(task_id)
            .await
            .unwrap()
            .unwrap()
            .container_id
            .unwrap();
        runtime.set_status(&container_id, status);
        let report = monitor.run_cycle().await;
        assert_eq!(report.checked, 1);

        runtime.resume();
        let finished = run.await.unwrap().unwrap();

        let again = monitor.run_cycle().await;
        assert_eq!(again.checked, 0);
        (finished, runtime, container_id)
    }

    #[tokio::test]
    async fn test_monitor_collecting_exited_container_mid_run() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let (finished, runtime, container_id) =
            run_with_monitor_cycle(&fixture, ContainerStatus::Exited).await;
        assert_eq!(finished, TaskStatus::Completed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.executed);
        assert!(task.container_id.is_none());
        assert!(task.error.is_none());
        // Removed by the monitor; the workflow found nothing left to clean up
        assert_eq!(runtime.removed(), vec![container_id]);
    }

    #[tokio::test]
    async fn test_monitor_failing_dead_container_mid_run() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let (finished, runtime, container_id) =
            run_with_monitor_cycle(&fixture, ContainerStatus::Dead).await;
        // The monitor's verdict stands
        assert_eq!(finished, TaskStatus::Failed);

        let task = fixture.store.find_task(fixture.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.executed);
        assert_eq!(task.error.as_deref(), Some("Container died unexpectedly"));
        assert!(task.container_id.is_none());
        assert_eq!(runtime.removed(), vec![container_id]);
    }
}
