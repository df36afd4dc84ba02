use agentbox_core::{ProviderKind, SubAgent};
use container_runtime::shell_quote;

use super::{AgentProvider, CommandOptions, CredentialSetup, PermissionMode};
use crate::parser::OutputFormat;

/// Claude Code, authenticated by API key or OAuth token
pub struct ClaudeProvider {
    oauth: bool,
}

impl ClaudeProvider {
    pub fn api_key() -> Self {
        Self { oauth: false }
    }

    pub fn oauth() -> Self {
        Self { oauth: true }
    }
}

/// File-name safe form of a sub-agent name
fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

/// One-key settings document; values that are not JSON literals become strings
fn settings_json(key: &str, value: &str) -> String {
    let value = serde_json::from_str::<serde_json::Value>(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    let mut settings = serde_json::Map::new();
    settings.insert(key.to_string(), value);
    serde_json::Value::Object(settings).to_string()
}

impl AgentProvider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        if self.oauth {
            ProviderKind::ClaudeOauth
        } else {
            ProviderKind::ClaudeApi
        }
    }

    fn name(&self) -> &'static str {
        if self.oauth {
            "Claude (OAuth)"
        } else {
            "Claude"
        }
    }

    fn cli(&self) -> &'static str {
        "claude"
    }

    fn install_command(&self) -> &'static str {
        "npm install -g @anthropic-ai/claude-code"
    }

    fn environment_setup(&self, secret: &str) -> CredentialSetup {
        let name = if self.oauth {
            "CLAUDE_CODE_OAUTH_TOKEN"
        } else {
            "ANTHROPIC_API_KEY"
        };
        CredentialSetup::EnvVar {
            name,
            value: secret.to_string(),
        }
    }

    fn build_command(&self, options: &CommandOptions, prompt: &str) -> String {
        let mut args = vec!["claude".to_string(), "-p".to_string(), shell_quote(prompt)];

        match options.output_format {
            Some(OutputFormat::Text) => args.push("--output-format text".to_string()),
            // stream-json requires --verbose in print mode
            _ => args.push("--output-format stream-json --verbose".to_string()),
        }
        if options.verbose && options.output_format == Some(OutputFormat::Text) {
            args.push("--verbose".to_string());
        }
        if let Some(model) = &options.model {
            args.push(format!("--model {}", shell_quote(model)));
        }
        match options.permission_mode {
            PermissionMode::Plan => args.push("--permission-mode plan".to_string()),
            PermissionMode::Normal => args.push("--dangerously-skip-permissions".to_string()),
        }
        if let Some(path) = &options.mcp_config_path {
            args.push(format!("--mcp-config {}", shell_quote(path)));
        }
        if !options.selected_mcp_servers.is_empty() {
            let allowed = options
                .selected_mcp_servers
                .iter()
                .map(|server| format!("mcp__{}", server))
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--allowedTools {}", shell_quote(&allowed)));
        }
        for (key, value) in &options.config_overrides {
            args.push(format!("--settings {}", shell_quote(&settings_json(key, value))));
        }

        args.join(" ")
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::StreamJson
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_plan_mode(&self) -> bool {
        true
    }

    fn supports_mcp(&self) -> bool {
        true
    }

    fn sub_agent_path(&self, agent: &SubAgent) -> Option<String> {
        Some(format!(".claude/agents/{}.md", slug(&agent.name)))
    }

    fn render_sub_agent(&self, agent: &SubAgent) -> Option<String> {
        let mut doc = String::from("---\n");
        doc.push_str(&format!("name: {}\n", slug(&agent.name)));
        doc.push_str(&format!("description: {}\n", agent.description.replace('\n', " ")));
        if !agent.tools.is_empty() {
            doc.push_str(&format!("tools: {}\n", agent.tools.join(", ")));
        }
        if let Some(model) = &agent.model {
            doc.push_str(&format!("model: {}\n", model));
        }
        doc.push_str("---\n\n");
        doc.push_str(agent.prompt.trim());
        doc.push('\n');
        Some(doc)
    }
}
