//! Execution engine: drives an agent CLI inside a task container
//!
//! Tool calls are persisted as they stream out of the container, one
//! message per call. The process-output reader only ever sends into an
//! unbounded channel; a separate consumer parses and persists, so store
//! latency never stalls the container's output pipe.

use std::collections::HashSet;
use std::sync::Arc;

use agentbox_core::{
    Environment, McpServer, MessageType, ProviderKind, Task, TaskMessage, TaskStore, UsageRecord,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use container_runtime::{shell_quote, ContainerRuntime, ExecRequest, OutputLine, OutputStream};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ExecutorError, Result};
use crate::exec::{failure, run_step};
use crate::parser::{ParsedOutput, ToolCall};
use crate::provider::{provider_for, AgentProvider, CommandOptions, PermissionMode};
use crate::render::render_tool_call;

/// Tool call carrying the plan in plan mode
const EXIT_PLAN_MODE: &str = "ExitPlanMode";
const MCP_CONFIG_FILE: &str = ".mcp.json";
const EMPTY_RESULT: &str = "The agent finished without reporting a result.";

/// One agent invocation
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub container_id: &'a str,
    pub prompt: &'a str,
    pub workdir: &'a str,
    pub provider: ProviderKind,
    pub model: Option<&'a str>,
    pub task: &'a Task,
    /// Names the invocation in usage records and errors
    pub label: &'a str,
}

/// The plan proposed by a plan-mode run, if any
pub fn extract_plan(parsed: &ParsedOutput) -> Option<String> {
    parsed
        .tool_call(EXIT_PLAN_MODE)
        .and_then(|call| call.input.get("plan"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|plan| !plan.is_empty())
        .map(str::to_string)
}

/// Prompt for the execution run following an accepted plan
pub fn plan_prompt(plan: &str, prompt: &str) -> String {
    format!(
        "Implement the following plan.\n\n{}\n\n---\n\nOriginal request:\n{}",
        plan, prompt
    )
}

/// Append the names of the selected MCP servers as a hint
pub fn with_mcp_hint(prompt: &str, servers: &[String]) -> String {
    if servers.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{}\n\nLeverage the following MCP servers where they help: {}.",
        prompt,
        servers.join(", ")
    )
}

/// Merge the workspace's MCP config with the selected servers.
/// Selected servers win on name collisions. `None` when nothing is configured.
pub fn merge_mcp_config(workspace: Option<&Value>, selected: &[&McpServer]) -> Option<Value> {
    let mut servers = workspace
        .and_then(|config| config.get("mcpServers"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    for server in selected {
        servers.insert(server.name.clone(), server.config.clone());
    }
    if servers.is_empty() {
        return None;
    }
    Some(json!({ "mcpServers": servers }))
}

/// Shell command writing `contents` to `path` (relative to the cwd or absolute)
fn write_file_command(path: &str, contents: &str) -> String {
    let mut command = String::new();
    if let Some((dir, _)) = path.rsplit_once('/') {
        if !dir.is_empty() {
            command.push_str(&format!("mkdir -p {} && ", shell_quote(dir)));
        }
    }
    command.push_str(&format!(
        "printf %s {} | base64 -d > {}",
        shell_quote(&BASE64.encode(contents)),
        shell_quote(path)
    ));
    command
}

async fn persist_tool_call(store: &dyn TaskStore, task_id: Uuid, call: &ToolCall) {
    let message = TaskMessage::tagged(task_id, MessageType::ToolCall, render_tool_call(call));
    if let Err(e) = store.append_task_message(message).await {
        warn!("Failed to persist tool call {} for task {}: {}", call.id, task_id, e);
    }
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn TaskStore>,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<dyn TaskStore>) -> Self {
        Self { runtime, store }
    }

    /// Run the agent for a task and persist its progress.
    ///
    /// Returns the agent's final result text, which is never empty.
    pub async fn execute_and_persist(&self, request: ExecutionRequest<'_>) -> Result<String> {
        let task = request.task;
        let environment = self
            .store
            .find_environment(task.environment_id)
            .await?
            .ok_or_else(|| ExecutorError::EnvironmentNotFound {
                environment_id: task.environment_id.to_string(),
            })?;
        let provider = provider_for(request.provider);

        if !environment.sub_agents.is_empty() {
            if let Err(e) = self.setup_sub_agents(&request, provider.as_ref(), &environment).await {
                warn!("Sub-agent setup failed for task {}: {}", task.id, e);
                self.append(TaskMessage::tagged(
                    task.id,
                    MessageType::Warning,
                    format!("Could not set up sub-agents, continuing without them: {}", e),
                ))
                .await?;
            }
        }

        let mut options = CommandOptions {
            model: request.model.map(str::to_string),
            output_format: Some(provider.output_format()),
            ..Default::default()
        };
        let mut prompt = request.prompt.to_string();

        if provider.supports_mcp() {
            let selected = environment.selected_mcp_servers(&task.mcp_servers);
            options.mcp_config_path = self.prepare_mcp_config(&request, &selected).await?;
            options.selected_mcp_servers = selected.iter().map(|s| s.name.clone()).collect();
            prompt = with_mcp_hint(&prompt, &options.selected_mcp_servers);
        }

        let prompt = if task.plan_mode && provider.supports_plan_mode() {
            self.plan(&request, provider.as_ref(), &options, &prompt).await?
        } else {
            prompt
        };

        let parsed = self
            .run_agent(&request, provider.as_ref(), &options, &prompt, request.label)
            .await?;

        let result = if parsed.final_result.trim().is_empty() {
            EMPTY_RESULT.to_string()
        } else {
            parsed.final_result.clone()
        };
        self.append(TaskMessage::tagged(task.id, MessageType::Result, result.clone()))
            .await?;

        info!(
            "Agent run '{}' for task {} finished with {} tool calls",
            request.label,
            task.id,
            parsed.tool_calls.len()
        );
        Ok(result)
    }

    /// Plan-mode phase. Returns the prompt for the execution run: the plan
    /// prepended to the original prompt, or the original prompt unchanged
    /// when no plan could be obtained.
    async fn plan(
        &self,
        request: &ExecutionRequest<'_>,
        provider: &dyn AgentProvider,
        options: &CommandOptions,
        prompt: &str,
    ) -> Result<String> {
        let plan_options = CommandOptions {
            permission_mode: PermissionMode::Plan,
            ..options.clone()
        };
        let label = format!("{}:plan", request.label);

        let plan = match self
            .run_agent(request, provider, &plan_options, prompt, &label)
            .await
        {
            Ok(parsed) => extract_plan(&parsed),
            Err(e) => {
                warn!("Plan-mode run for task {} failed: {}", request.task.id, e);
                None
            }
        };

        match plan {
            Some(plan) => {
                self.append(TaskMessage::tagged(request.task.id, MessageType::Plan, plan.clone()))
                    .await?;
                Ok(plan_prompt(&plan, prompt))
            }
            None => {
                warn!(
                    "No plan captured for task {}, running the original prompt",
                    request.task.id
                );
                Ok(prompt.to_string())
            }
        }
    }

    /// One CLI invocation; a non-zero exit is an error
    async fn run_agent(
        &self,
        request: &ExecutionRequest<'_>,
        provider: &dyn AgentProvider,
        options: &CommandOptions,
        prompt: &str,
        label: &str,
    ) -> Result<ParsedOutput> {
        let task_id = request.task.id;
        let exec = ExecRequest::new(provider.build_command(options, prompt)).in_dir(request.workdir);
        info!(
            "Running {} ({}) for task {} in {}",
            provider.name(),
            label,
            task_id,
            request.container_id
        );

        let parsed = if provider.supports_streaming() {
            let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
            let store = self.store.clone();
            let mut parser = provider.create_parser();

            let consumer = tokio::spawn(async move {
                let mut persisted = HashSet::new();
                while let Some(line) = rx.recv().await {
                    if line.stream == OutputStream::Stderr {
                        trace!("[stderr] {}", line.line);
                        continue;
                    }
                    for call in parser.push_line(&line.line) {
                        persist_tool_call(store.as_ref(), task_id, &call).await;
                        persisted.insert(call.id);
                    }
                }
                let parsed = parser.finish();
                // Calls only complete at end of stream
                for call in parsed.tool_calls.iter().filter(|c| !persisted.contains(&c.id)) {
                    persist_tool_call(store.as_ref(), task_id, call).await;
                }
                parsed
            });

            let output = self
                .runtime
                .execute_streaming(request.container_id, &exec, tx)
                .await;
            let parsed = consumer.await?;
            let output = output?;
            if !output.success() {
                return Err(failure(label, &output));
            }
            parsed
        } else {
            let output = self.runtime.execute(request.container_id, &exec).await?;
            if !output.success() {
                return Err(failure(label, &output));
            }
            let parsed = provider.parse_output(&output.stdout);
            for call in &parsed.tool_calls {
                persist_tool_call(self.store.as_ref(), task_id, call).await;
            }
            parsed
        };

        if let Some(cost) = parsed.total_cost_usd {
            self.record_usage(request, label, cost).await;
        }
        Ok(parsed)
    }

    async fn record_usage(&self, request: &ExecutionRequest<'_>, label: &str, cost: f64) {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            provider: request.provider,
            model: request.model.map(str::to_string),
            cost_usd: cost,
            task_id: request.task.id,
            environment_id: request.task.environment_id,
            user_id: request.task.user_id,
            label: label.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_usage(record).await {
            warn!("Failed to record usage for task {}: {}", request.task.id, e);
        }
    }

    /// Write the merged MCP config into the container; returns its path
    async fn prepare_mcp_config(
        &self,
        request: &ExecutionRequest<'_>,
        selected: &[&McpServer],
    ) -> Result<Option<String>> {
        let read = ExecRequest::new(format!("cat {} 2>/dev/null", MCP_CONFIG_FILE)).in_dir(request.workdir);
        let workspace_config = match self.runtime.execute(request.container_id, &read).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => match serde_json::from_str::<Value>(&output.stdout) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring unparseable {}: {}", MCP_CONFIG_FILE, e);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                debug!("Could not read {}: {}", MCP_CONFIG_FILE, e);
                None
            }
        };

        let Some(merged) = merge_mcp_config(workspace_config.as_ref(), selected) else {
            return Ok(None);
        };
        let path = format!("/tmp/agentbox-mcp-{}.json", request.task.id);
        let write = ExecRequest::new(write_file_command(&path, &serde_json::to_string_pretty(&merged)?));
        run_step(self.runtime.as_ref(), request.container_id, &write, "MCP config").await?;
        Ok(Some(path))
    }

    async fn setup_sub_agents(
        &self,
        request: &ExecutionRequest<'_>,
        provider: &dyn AgentProvider,
        environment: &Environment,
    ) -> Result<()> {
        let mut written = 0;
        for agent in &environment.sub_agents {
            let (Some(path), Some(contents)) = (provider.sub_agent_path(agent), provider.render_sub_agent(agent)) else {
                continue;
            };
            let write = ExecRequest::new(write_file_command(&path, &contents)).in_dir(request.workdir);
            run_step(self.runtime.as_ref(), request.container_id, &write, "sub-agent setup").await?;
            written += 1;
        }
        if written > 0 {
            info!("Installed {} sub-agents for task {}", written, request.task.id);
        }
        Ok(())
    }

    async fn append(&self, message: TaskMessage) -> Result<()> {
        self.store.append_task_message(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRuntime, Fixture};
    use agentbox_core::SubAgent;

    const EDIT_RUN: &str = r#"{"type":"system","subtype":"init"}
{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Edit","input":{"file_path":"/a.py","old_string":"a - b","new_string":"a + b"}}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"ok"}]}}
{"type":"result","subtype":"success","result":"Fixed the sign.","total_cost_usd":0.02}"#;

    const PLAN_RUN: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_p","name":"ExitPlanMode","input":{"plan":"1. Flip the sign in a.py"}}]}}
{"type":"result","result":"Plan ready","total_cost_usd":0.01}"#;

    fn request<'a>(task: &'a Task, provider: ProviderKind) -> ExecutionRequest<'a> {
        ExecutionRequest {
            container_id: "c1",
            prompt: "Fix the sign error in a.py",
            workdir: "/workspace/widgets/repo",
            provider,
            model: Some("claude-sonnet-4"),
            task,
            label: "execute",
        }
    }

    fn tool_messages(messages: &[TaskMessage]) -> Vec<&TaskMessage> {
        messages.iter().filter(|m| m.is_type(MessageType::ToolCall)).collect()
    }

    #[test]
    fn test_extract_plan() {
        let parsed = crate::parser::parse_output(crate::parser::OutputFormat::StreamJson, PLAN_RUN);
        assert_eq!(extract_plan(&parsed).as_deref(), Some("1. Flip the sign in a.py"));

        let none = crate::parser::parse_output(crate::parser::OutputFormat::StreamJson, EDIT_RUN);
        assert_eq!(extract_plan(&none), None);
    }

    #[test]
    fn test_plan_prompt_prepends_plan() {
        let prompt = plan_prompt("1. Do it", "Fix it");
        assert!(prompt.starts_with("Implement the following plan.\n\n1. Do it"));
        assert!(prompt.ends_with("Original request:\nFix it"));
    }

    #[test]
    fn test_merge_mcp_config() {
        let workspace = json!({ "mcpServers": { "docs": { "command": "docs-mcp" }, "linear": { "command": "old" } } });
        let linear = McpServer {
            name: "linear".into(),
            config: json!({ "command": "linear-mcp" }),
        };
        let merged = merge_mcp_config(Some(&workspace), &[&linear]).unwrap();
        assert_eq!(merged["mcpServers"]["linear"]["command"], "linear-mcp");
        assert_eq!(merged["mcpServers"]["docs"]["command"], "docs-mcp");

        assert!(merge_mcp_config(None, &[]).is_none());
    }

    #[test]
    fn test_mcp_hint() {
        assert_eq!(with_mcp_hint("Go", &[]), "Go");
        assert!(with_mcp_hint("Go", &["linear".into()]).ends_with("MCP servers where they help: linear."));
    }

    #[tokio::test]
    async fn test_tool_call_and_usage_persisted() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", EDIT_RUN, 0));
        let engine = ExecutionEngine::new(runtime.clone(), fixture.store.clone());

        let result = engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();
        assert_eq!(result, "Fixed the sign.");

        let messages = fixture.messages().await;
        let tools = tool_messages(&messages);
        assert_eq!(tools.len(), 1);
        assert!(tools[0].content.contains("/a.py"));
        assert!(messages.iter().any(|m| m.is_type(MessageType::Result) && m.content == "Fixed the sign."));

        let usage = fixture.store.list_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].cost_usd, 0.02);
        assert_eq!(usage[0].label, "execute");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", "", 1));
        let engine = ExecutionEngine::new(runtime, fixture.store.clone());

        let err = engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ProcessFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_plan_mode_runs_plan_then_execution() {
        let fixture = Fixture::build(ProviderKind::ClaudeApi, |t| t.with_plan_mode(true)).await;
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond("--permission-mode plan", PLAN_RUN, 0)
                .respond("claude -p", EDIT_RUN, 0),
        );
        let engine = ExecutionEngine::new(runtime.clone(), fixture.store.clone());

        engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();

        let messages = fixture.messages().await;
        let plan = messages.iter().find(|m| m.is_type(MessageType::Plan)).unwrap();
        assert_eq!(plan.content, "1. Flip the sign in a.py");

        let commands = runtime.commands();
        let execution = commands.iter().find(|c| c.contains("--dangerously-skip-permissions")).unwrap();
        assert!(execution.contains("Implement the following plan."));

        let labels: Vec<String> = fixture.store.list_usage().await.unwrap().into_iter().map(|u| u.label).collect();
        assert_eq!(labels, vec!["execute:plan".to_string(), "execute".to_string()]);
    }

    #[tokio::test]
    async fn test_plan_mode_without_plan_falls_back() {
        let fixture = Fixture::build(ProviderKind::ClaudeApi, |t| t.with_plan_mode(true)).await;
        let no_plan = r#"{"type":"result","result":"I would rather just do it"}"#;
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond("--permission-mode plan", no_plan, 0)
                .respond("claude -p", EDIT_RUN, 0),
        );
        let engine = ExecutionEngine::new(runtime.clone(), fixture.store.clone());

        let result = engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();
        assert!(!result.is_empty());

        let messages = fixture.messages().await;
        assert!(!messages.iter().any(|m| m.is_type(MessageType::Plan)));
        let execution = runtime
            .commands()
            .into_iter()
            .find(|c| c.contains("--dangerously-skip-permissions"))
            .unwrap();
        assert!(!execution.contains("Implement the following plan."));
    }

    #[tokio::test]
    async fn test_plan_mode_failure_falls_back() {
        let fixture = Fixture::build(ProviderKind::ClaudeApi, |t| t.with_plan_mode(true)).await;
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond("--permission-mode plan", "", 2)
                .respond("claude -p", "", 0),
        );
        let engine = ExecutionEngine::new(runtime, fixture.store.clone());

        let result = engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();
        assert_eq!(result, EMPTY_RESULT);
    }

    #[tokio::test]
    async fn test_text_provider_persists_final_text_once() {
        let fixture = Fixture::new(ProviderKind::Gemini).await;
        let runtime = Arc::new(FakeRuntime::new().respond("gemini", "Added the docs.\n", 0));
        let engine = ExecutionEngine::new(runtime, fixture.store.clone());

        let result = engine
            .execute_and_persist(request(&fixture.task, ProviderKind::Gemini))
            .await
            .unwrap();
        assert_eq!(result, "Added the docs.");

        let messages = fixture.messages().await;
        assert!(tool_messages(&messages).is_empty());
        assert_eq!(messages.iter().filter(|m| m.is_type(MessageType::Result)).count(), 1);
        assert!(fixture.store.list_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mcp_servers_and_sub_agents() {
        let mut fixture =
            Fixture::build(ProviderKind::ClaudeApi, |t| t.with_mcp_servers(vec!["linear".into()])).await;
        fixture
            .update_environment(|env| {
                env.mcp_servers = vec![McpServer {
                    name: "linear".into(),
                    config: json!({ "command": "linear-mcp" }),
                }];
                env.sub_agents = vec![SubAgent {
                    name: "reviewer".into(),
                    description: "Reviews diffs".into(),
                    prompt: "Review carefully.".into(),
                    tools: vec![],
                    model: None,
                }];
            })
            .await;
        let runtime = Arc::new(FakeRuntime::new().respond("claude -p", EDIT_RUN, 0));
        let engine = ExecutionEngine::new(runtime.clone(), fixture.store.clone());

        engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();

        assert!(runtime.ran(".claude/agents/reviewer.md"));
        let mcp_path = format!("/tmp/agentbox-mcp-{}.json", fixture.task.id);
        assert!(runtime.ran(&mcp_path));
        let agent = runtime.commands().into_iter().find(|c| c.contains("claude -p")).unwrap();
        assert!(agent.contains(&format!("--mcp-config {}", mcp_path)));
        assert!(agent.contains("--allowedTools mcp__linear"));
        assert!(agent.contains("Leverage the following MCP servers"));
    }

    #[tokio::test]
    async fn test_sub_agent_failure_is_a_warning() {
        let mut fixture = Fixture::new(ProviderKind::ClaudeApi).await;
        fixture
            .update_environment(|env| {
                env.sub_agents = vec![SubAgent {
                    name: "reviewer".into(),
                    description: "Reviews".into(),
                    prompt: "Review.".into(),
                    tools: vec![],
                    model: None,
                }];
            })
            .await;
        let runtime = Arc::new(
            FakeRuntime::new()
                .respond(".claude/agents", "", 1)
                .respond("claude -p", EDIT_RUN, 0),
        );
        let engine = ExecutionEngine::new(runtime, fixture.store.clone());

        engine
            .execute_and_persist(request(&fixture.task, ProviderKind::ClaudeApi))
            .await
            .unwrap();

        let messages = fixture.messages().await;
        assert!(messages.iter().any(|m| m.is_type(MessageType::Warning) && m.content.contains("sub-agents")));
    }
}
