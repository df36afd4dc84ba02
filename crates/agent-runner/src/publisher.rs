//! Pull request publishing
//!
//! Turns the agent's working-tree changes into a branch, a commit and a
//! pull request against the environment's default branch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentbox_core::{Environment, MessageType, Task, TaskMessage, TaskStore, TaskUpdate};
use chrono::Utc;
use container_runtime::{shell_quote, ContainerRuntime, ExecRequest};
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, Result};
use crate::exec::run_step;
use crate::github::{NewPullRequest, SourceHost};
use crate::provider::{AgentProvider, CommandOptions, GeminiProvider};
use crate::provisioner::{workspace_dir, WORKSPACE_ROOT};

const NO_CHANGES_MESSAGE: &str = "The agent made no changes, so no pull request was opened.";
const DEFAULT_TITLE: &str = "Changes from Agentbox";
const MAX_TITLE_LEN: usize = 72;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub workspace_root: String,
    /// Characters of diff handed to the title suggester
    pub diff_limit: usize,
    /// Settle time before checking mergeability
    pub auto_merge_delay: Duration,
    /// Suggested titles shorter than this are discarded
    pub min_title_len: usize,
    pub admin_gemini_api_key: Option<String>,
    pub branch_prefix: String,
    pub title_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workspace_root: WORKSPACE_ROOT.to_string(),
            diff_limit: 8000,
            auto_merge_delay: Duration::from_secs(5),
            min_title_len: 10,
            admin_gemini_api_key: None,
            branch_prefix: "agentbox/".to_string(),
            title_timeout: Duration::from_secs(120),
        }
    }
}

/// What `create_from_changes` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Clean working tree, nothing published
    NoChanges,
    /// Changes committed locally but no installation grants push access
    NoAccess { branch: String },
    Opened { url: String, number: u64, merged: bool },
}

/// `<prefix><first 8 of task id>-<utc timestamp>`
pub fn branch_name(prefix: &str, task: &Task) -> String {
    let id = task.id.simple().to_string();
    format!("{}{}-{}", prefix, &id[..8], Utc::now().format("%Y%m%d%H%M%S"))
}

/// Truncate on a char boundary
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut kept: String = text.chars().take(max).collect();
    kept.push_str("\n… (truncated)");
    kept
}

/// Clean up a model-suggested title; `None` if unusable
pub fn sanitize_title(raw: &str, min_len: usize) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line)
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '*')
        .trim();
    if line.chars().count() < min_len {
        return None;
    }
    Some(line.chars().take(MAX_TITLE_LEN).collect())
}

pub fn default_title(task: &Task) -> String {
    let title = task.title.trim();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.chars().take(MAX_TITLE_LEN).collect()
    }
}

fn title_prompt(task: &Task, diff: &str) -> String {
    format!(
        "Write a concise pull request title (at most {} characters) for the change below. \
         Reply with the title only.\n\nTask: {}\n\nDiff:\n{}",
        MAX_TITLE_LEN, task.title, diff
    )
}

fn pull_request_body(task: &Task, summary: &str) -> String {
    format!(
        "{}\n\n---\nOpened by Agentbox for task `{}`.",
        summary.trim(),
        task.id
    )
}

pub struct PullRequestPublisher {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn TaskStore>,
    source_host: Arc<dyn SourceHost>,
    config: PublisherConfig,
}

impl PullRequestPublisher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn TaskStore>,
        source_host: Arc<dyn SourceHost>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            source_host,
            config,
        }
    }

    /// Publish the working-tree changes of a task's container
    pub async fn create_from_changes(
        &self,
        container_id: &str,
        task: &Task,
        summary: &str,
    ) -> Result<PublishOutcome> {
        let environment = self
            .store
            .find_environment(task.environment_id)
            .await?
            .ok_or_else(|| ExecutorError::EnvironmentNotFound {
                environment_id: task.environment_id.to_string(),
            })?;
        let workspace = workspace_dir(&self.config.workspace_root, &environment)?;

        let status = run_step(
            self.runtime.as_ref(),
            container_id,
            &ExecRequest::new("git status --porcelain").in_dir(&workspace),
            "git status",
        )
        .await?;
        if status.stdout.trim().is_empty() {
            info!("Task {} produced no changes", task.id);
            self.append(TaskMessage::assistant(task.id, NO_CHANGES_MESSAGE)).await?;
            return Ok(PublishOutcome::NoChanges);
        }

        let branch = branch_name(&self.config.branch_prefix, task);
        let commit = format!(
            "git checkout -b {branch} && git add -A && git commit -q -m {title} -m {body}",
            branch = shell_quote(&branch),
            title = shell_quote(&default_title(task)),
            body = shell_quote(summary.trim()),
        );
        run_step(
            self.runtime.as_ref(),
            container_id,
            &ExecRequest::new(commit).in_dir(&workspace),
            "git commit",
        )
        .await?;

        let diff = self.diff(container_id, &workspace, &environment).await;
        let title = self.suggest_title(container_id, &workspace, task, &diff).await;

        let credentials = self
            .store
            .find_user_credentials(task.user_id)
            .await?
            .ok_or_else(|| ExecutorError::CredentialsNotFound {
                user_id: task.user_id.to_string(),
            })?;
        let repository = &environment.repository_full_name;
        let Some(token) = self
            .source_host
            .repository_token(&credentials.github.installation_ids, repository)
            .await?
        else {
            warn!("No push access to {} for task {}", repository, task.id);
            self.append(TaskMessage::tagged(
                task.id,
                MessageType::Warning,
                format!(
                    "Changes were committed on branch {} but could not be pushed: no GitHub App \
                     installation grants access to {}. Install the app on the repository and run \
                     the task again.",
                    branch, repository
                ),
            ))
            .await?;
            return Ok(PublishOutcome::NoAccess { branch });
        };

        let push = format!(
            "git push {} HEAD:refs/heads/{}",
            shell_quote(&self.source_host.clone_url(repository, Some(&token))),
            shell_quote(&branch)
        );
        run_step(
            self.runtime.as_ref(),
            container_id,
            &ExecRequest::new(push).in_dir(&workspace),
            "git push",
        )
        .await?;

        let pull = self
            .source_host
            .create_pull_request(
                &token,
                repository,
                &NewPullRequest {
                    title: title.clone(),
                    head: branch.clone(),
                    base: environment.default_branch.clone(),
                    body: pull_request_body(task, summary),
                },
            )
            .await?;
        self.store
            .update_task(task.id, TaskUpdate::new().pr(pull.html_url.clone()))
            .await?;
        self.append(TaskMessage::assistant(
            task.id,
            format!("Opened pull request #{}: {}", pull.number, title),
        ))
        .await?;
        self.append(TaskMessage::tagged(task.id, MessageType::PrLink, pull.html_url.clone()))
            .await?;

        let merged = if task.auto_merge {
            self.auto_merge(task, &token, repository, pull.number, &title).await?
        } else {
            false
        };

        Ok(PublishOutcome::Opened {
            url: pull.html_url,
            number: pull.number,
            merged,
        })
    }

    /// Diff against the default branch; empty when it can't be computed
    async fn diff(&self, container_id: &str, workspace: &str, environment: &Environment) -> String {
        let request = ExecRequest::new(format!(
            "git diff {}...HEAD",
            shell_quote(&format!("origin/{}", environment.default_branch))
        ))
        .in_dir(workspace);
        match run_step(self.runtime.as_ref(), container_id, &request, "git diff").await {
            Ok(output) => truncate(&output.stdout, self.config.diff_limit),
            Err(e) => {
                warn!("Could not compute diff: {}", e);
                String::new()
            }
        }
    }

    async fn suggest_title(&self, container_id: &str, workspace: &str, task: &Task, diff: &str) -> String {
        let fallback = default_title(task);
        let Some(key) = self.config.admin_gemini_api_key.as_deref().filter(|k| !k.is_empty()) else {
            return fallback;
        };
        if diff.trim().is_empty() {
            return fallback;
        }

        // Only the environment's own agent CLI is installed at provisioning
        let provider = GeminiProvider::admin();
        let install = ExecRequest::new(provider.ensure_installed_command());
        if let Err(e) = run_step(self.runtime.as_ref(), container_id, &install, "title CLI install").await {
            warn!("Could not install {} for title suggestion: {}", provider.cli(), e);
            return fallback;
        }
        let command = provider.build_command(&CommandOptions::default(), &title_prompt(task, diff));
        let request = ExecRequest::new(command)
            .in_dir(workspace)
            .with_env(BTreeMap::from([("GEMINI_API_KEY".to_string(), key.to_string())]))
            .with_timeout(self.config.title_timeout);

        match run_step(self.runtime.as_ref(), container_id, &request, "title suggestion").await {
            Ok(output) => {
                let parsed = provider.parse_output(&output.stdout);
                match sanitize_title(&parsed.final_result, self.config.min_title_len) {
                    Some(title) => title,
                    None => {
                        debug!("Discarding unusable title suggestion {:?}", parsed.final_result);
                        fallback
                    }
                }
            }
            Err(e) => {
                warn!("Title suggestion failed for task {}: {}", task.id, e);
                fallback
            }
        }
    }

    /// Optional merge step; failures become warning messages
    async fn auto_merge(
        &self,
        task: &Task,
        token: &str,
        repository: &str,
        number: u64,
        title: &str,
    ) -> Result<bool> {
        tokio::time::sleep(self.config.auto_merge_delay).await;

        let warning = match self.try_merge(token, repository, number, title).await {
            Ok(true) => {
                self.store
                    .update_task(task.id, TaskUpdate::new().merged(true))
                    .await?;
                self.append(TaskMessage::assistant(
                    task.id,
                    format!("Merged pull request #{}.", number),
                ))
                .await?;
                info!("Auto-merged pull request #{} for task {}", number, task.id);
                return Ok(true);
            }
            Ok(false) => format!(
                "Pull request #{} is not mergeable yet; leaving it open for a manual merge.",
                number
            ),
            Err(e) => format!("Auto-merge of pull request #{} failed: {}", number, e),
        };

        warn!("{}", warning);
        self.append(TaskMessage::tagged(task.id, MessageType::Warning, warning))
            .await?;
        Ok(false)
    }

    async fn try_merge(&self, token: &str, repository: &str, number: u64, title: &str) -> Result<bool> {
        let pull = self
            .source_host
            .get_pull_request(token, repository, number)
            .await?;
        if pull.merged {
            return Ok(true);
        }
        if pull.mergeable != Some(true) {
            return Ok(false);
        }
        self.source_host
            .merge_pull_request(token, repository, number, title)
            .await
    }

    async fn append(&self, message: TaskMessage) -> Result<()> {
        self.store.append_task_message(message).await?;
        Ok(())
    }
}
