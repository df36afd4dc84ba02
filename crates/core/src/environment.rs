//! Environment - static configuration a task runs against

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// The AI coding agent CLI an environment drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    ClaudeApi,
    ClaudeOauth,
    Gemini,
    GeminiAdmin,
    CodexApi,
    CodexOauth,
}

impl ProviderKind {
    /// Parse provider kind from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude-api" | "claude" | "anthropic" => Ok(Self::ClaudeApi),
            "claude-oauth" => Ok(Self::ClaudeOauth),
            "gemini" | "gemini-cli" => Ok(Self::Gemini),
            "gemini-admin" => Ok(Self::GeminiAdmin),
            "codex-api" | "codex" | "openai" => Ok(Self::CodexApi),
            "codex-oauth" => Ok(Self::CodexOauth),
            _ => Err(Error::InvalidInput(format!("Invalid provider: {}", s))),
        }
    }

    /// Get the canonical string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeApi => "claude-api",
            Self::ClaudeOauth => "claude-oauth",
            Self::Gemini => "gemini",
            Self::GeminiAdmin => "gemini-admin",
            Self::CodexApi => "codex-api",
            Self::CodexOauth => "codex-oauth",
        }
    }
}

/// A reusable named sub-agent materialized into the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgent {
    pub name: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Reference to an external tool server (MCP)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    /// Connection descriptor as the agent CLI expects it
    /// (`{"command": ..., "args": [...]}` or `{"type": "http", "url": ...}`)
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// `owner/repo`
    pub repository_full_name: String,
    pub default_branch: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    /// Script run once per container before the agent
    #[serde(default)]
    pub configuration_script: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub sub_agents: Vec<SubAgent>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(
        user_id: Uuid,
        name: impl Into<String>,
        repository_full_name: impl Into<String>,
        provider: ProviderKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            repository_full_name: repository_full_name.into(),
            default_branch: "main".to_string(),
            provider,
            model: None,
            configuration_script: None,
            env_vars: BTreeMap::new(),
            sub_agents: Vec::new(),
            mcp_servers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Split `owner/repo`
    pub fn owner_and_repo(&self) -> Result<(&str, &str)> {
        match self.repository_full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => Ok((owner, repo)),
            _ => Err(Error::InvalidInput(format!(
                "Repository must be owner/repo, got '{}'",
                self.repository_full_name
            ))),
        }
    }

    /// MCP servers selected by name, in environment order
    pub fn selected_mcp_servers(&self, names: &[String]) -> Vec<&McpServer> {
        self.mcp_servers
            .iter()
            .filter(|server| names.iter().any(|n| n == &server.name))
            .collect()
    }
}
