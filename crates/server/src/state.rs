//! Application state

use std::sync::Arc;

use agent_runner::{HealthMonitor, TaskWorkflow};
use agentbox_core::TaskStore;
use container_runtime::ContainerRuntime;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn TaskStore>,
    runtime: Arc<dyn ContainerRuntime>,
    workflow: Arc<TaskWorkflow>,
    monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runtime: Arc<dyn ContainerRuntime>,
        workflow: Arc<TaskWorkflow>,
        monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                runtime,
                workflow,
                monitor,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn workflow(&self) -> &Arc<TaskWorkflow> {
        &self.inner.workflow
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.inner.monitor
    }
}
