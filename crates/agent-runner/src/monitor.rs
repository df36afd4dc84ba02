//! Health monitor
//!
//! Periodically reconciles tasks that still reference a container against
//! what the runtime reports for that container.

use std::sync::Arc;
use std::time::Duration;

use agentbox_core::{MessageType, Task, TaskMessage, TaskStatus, TaskStore, TaskUpdate};
use container_runtime::{redact_tokens, ContainerRuntime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Upper bound for checking a single task
    pub check_timeout: Duration,
    /// Log lines attached to a completion message
    pub log_tail: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(30),
            log_tail: 200,
        }
    }
}

/// What the monitor saw for one task's container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOutcome {
    /// Still running or starting; nothing to do
    InProgress,
    Exited,
    Died,
    Missing,
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The runtime was unreachable and nothing was checked
    pub skipped: bool,
    pub checked: usize,
    pub in_progress: usize,
    pub exited: usize,
    pub died: usize,
    pub missing: usize,
    pub errors: usize,
}

impl CycleReport {
    fn count(&mut self, outcome: ContainerOutcome) {
        match outcome {
            ContainerOutcome::InProgress => self.in_progress += 1,
            ContainerOutcome::Exited => self.exited += 1,
            ContainerOutcome::Died => self.died += 1,
            ContainerOutcome::Missing => self.missing += 1,
        }
    }
}

/// Stops a started monitor
pub struct MonitorHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop to stop and wait for the in-flight cycle to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            warn!("Health monitor task ended abnormally: {}", e);
        }
    }
}

pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn TaskStore>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn TaskStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
        }
    }

    /// Run cycles on the configured interval until the handle is shut down.
    /// The first cycle runs immediately.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, mut stop) = oneshot::channel();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Health monitor started (every {:?})", self.config.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.run_cycle().await;
                        debug!("Health monitor cycle: {:?}", report);
                    }
                    _ = &mut stop => break,
                }
            }
            info!("Health monitor stopped");
        });
        MonitorHandle { shutdown, join }
    }

    /// One reconciliation pass over every task awaiting its container outcome
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if !self.runtime.is_available().await {
            warn!(
                "{} runtime unavailable, skipping health check",
                self.runtime.kind().as_str()
            );
            report.skipped = true;
            return report;
        }

        let tasks = match self.store.find_tasks_awaiting_container_outcome().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Failed to load tasks for health check: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for task in tasks {
            report.checked += 1;
            match tokio::time::timeout(self.config.check_timeout, self.check_task(&task)).await {
                Ok(Ok(outcome)) => report.count(outcome),
                Ok(Err(e)) => {
                    warn!("Health check failed for task {}: {}", task.id, e);
                    report.errors += 1;
                }
                Err(_) => {
                    warn!(
                        "Health check for task {} timed out after {:?}",
                        task.id, self.config.check_timeout
                    );
                    report.errors += 1;
                }
            }
        }

        if report.checked > 0 {
            info!(
                "Health check: {} tasks, {} exited, {} died, {} missing, {} errors",
                report.checked, report.exited, report.died, report.missing, report.errors
            );
        }
        report
    }

    /// Remove every managed container that is not running
    pub async fn cleanup_orphaned_containers(&self) -> Result<usize> {
        let removed = self.runtime.cleanup_containers().await?;
        if removed > 0 {
            info!("Removed {} orphaned containers", removed);
        }
        Ok(removed)
    }

    async fn check_task(&self, task: &Task) -> Result<ContainerOutcome> {
        let Some(container_id) = task.container_id.as_deref() else {
            return Ok(ContainerOutcome::InProgress);
        };

        let outcome = match self.runtime.container_info(container_id).await? {
            None => ContainerOutcome::Missing,
            Some(info) if info.status.is_exited() => ContainerOutcome::Exited,
            Some(info) if info.status.is_abnormal() => ContainerOutcome::Died,
            Some(_) => ContainerOutcome::InProgress,
        };

        match outcome {
            ContainerOutcome::InProgress => {}
            ContainerOutcome::Exited => self.handle_exited(task, container_id).await?,
            ContainerOutcome::Died => {
                self.fail(
                    task,
                    "Container died unexpectedly",
                    MessageType::Error,
                    format!("Container {} died unexpectedly.", container_id),
                )
                .await?
            }
            ContainerOutcome::Missing => {
                self.fail(
                    task,
                    "Container not found",
                    MessageType::Warning,
                    format!(
                        "Container {} was not found; it may have been removed outside Agentbox.",
                        container_id
                    ),
                )
                .await?
            }
        }
        Ok(outcome)
    }

    async fn handle_exited(&self, task: &Task, container_id: &str) -> Result<()> {
        let logs = match self.runtime.container_logs(container_id, self.config.log_tail).await {
            Ok(logs) => redact_tokens(logs.trim_end()),
            Err(e) => format!("(logs unavailable: {})", e),
        };
        self.store
            .append_task_message(TaskMessage::assistant(
                task.id,
                format!("Container finished. Last output:\n```\n{}\n```", logs),
            ))
            .await?;
        self.store
            .update_task(task.id, TaskUpdate::new().executed(true))
            .await?;

        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("Failed to remove exited container {}: {}", container_id, e);
            return Ok(());
        }
        self.store
            .update_task(task.id, TaskUpdate::new().clear_container())
            .await?;
        info!("Container {} of task {} exited and was removed", container_id, task.id);
        Ok(())
    }

    async fn fail(
        &self,
        task: &Task,
        error: &str,
        message_type: MessageType,
        message: String,
    ) -> Result<()> {
        warn!("Task {}: {}", task.id, message);
        let mut update = TaskUpdate::new().executed(true).error(error);
        // Pending tasks never jump straight to a terminal state
        if task.status == TaskStatus::Running {
            update = update.status(TaskStatus::Failed);
        }
        self.store.update_task(task.id, update).await?;
        self.store
            .append_task_message(TaskMessage::tagged(task.id, message_type, message))
            .await?;
        Ok(())
    }
}
