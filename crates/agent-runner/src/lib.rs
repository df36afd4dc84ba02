//! Agent Runner - task orchestration for containerized coding agents
//!
//! This crate drives a task from a pending record to a published pull
//! request: it provisions a container, runs the selected agent CLI inside
//! it, persists the agent's progress, publishes the resulting changes and
//! reconciles container state in the background.

mod engine;
mod error;
mod exec;
mod github;
mod monitor;
mod parser;
mod provider;
mod provisioner;
mod publisher;
mod render;
mod workflow;

#[cfg(test)]
mod testing;

pub use engine::{ExecutionEngine, ExecutionRequest};
pub use error::{ExecutorError, Result};
pub use github::{GithubAppConfig, GithubClient, NewPullRequest, PullRequest, SourceHost};
pub use monitor::{ContainerOutcome, CycleReport, HealthMonitor, MonitorConfig, MonitorHandle};
pub use parser::{create_parser, parse_output, OutputFormat, OutputParser, ParsedOutput, ToolCall};
pub use provider::{provider_for, AgentProvider, CommandOptions, CredentialSetup, PermissionMode};
pub use provisioner::{
    ContainerProvisioner, ProvisionedContainer, ProvisionerConfig, DEFAULT_WORKER_IMAGE,
    READY_SENTINEL, WORKSPACE_ROOT,
};
pub use publisher::{PublishOutcome, PublisherConfig, PullRequestPublisher};
pub use render::render_tool_call;
pub use workflow::TaskWorkflow;
