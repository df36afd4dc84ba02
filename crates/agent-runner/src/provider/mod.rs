//! Agent provider adapters
//!
//! Each provider knows how to expose its credential, build its CLI
//! invocation and parse what the CLI prints.

use agentbox_core::{ProviderKind, SubAgent};

use crate::parser::{self, OutputFormat, OutputParser, ParsedOutput};

mod claude;
mod codex;
mod gemini;

pub use claude::ClaudeProvider;
pub use codex::CodexProvider;
pub use gemini::GeminiProvider;

/// Whether the agent may act or only propose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Normal,
    Plan,
}

/// Options recognized by [`AgentProvider::build_command`]
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub model: Option<String>,
    pub verbose: bool,
    /// Requested output shape; providers without a choice ignore it
    pub output_format: Option<OutputFormat>,
    pub permission_mode: PermissionMode,
    /// Path of an MCP config file inside the container
    pub mcp_config_path: Option<String>,
    pub selected_mcp_servers: Vec<String>,
    /// `key=value` overrides passed through to the CLI config
    pub config_overrides: Vec<(String, String)>,
}

/// How a provider's credential reaches the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSetup {
    /// Exported as an environment variable
    EnvVar { name: &'static str, value: String },
    /// Written to a file in the agent user's home directory
    AuthFile { path: &'static str, contents: String },
}

/// A coding-agent CLI
pub trait AgentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str;

    /// Executable name on `PATH`
    fn cli(&self) -> &'static str;

    /// Shell command installing the CLI
    fn install_command(&self) -> &'static str;

    fn environment_setup(&self, secret: &str) -> CredentialSetup;

    fn build_command(&self, options: &CommandOptions, prompt: &str) -> String;

    fn output_format(&self) -> OutputFormat;

    fn supports_streaming(&self) -> bool;

    fn supports_plan_mode(&self) -> bool {
        false
    }

    fn supports_mcp(&self) -> bool {
        false
    }

    /// Where a sub-agent definition lives, relative to the workspace.
    /// `None` when the provider has no sub-agent concept.
    fn sub_agent_path(&self, _agent: &SubAgent) -> Option<String> {
        None
    }

    /// Contents of a sub-agent definition file
    fn render_sub_agent(&self, _agent: &SubAgent) -> Option<String> {
        None
    }

    /// Command guarding the first agent invocation
    fn ensure_installed_command(&self) -> String {
        format!(
            "command -v {} >/dev/null 2>&1 || {}",
            self.cli(),
            self.install_command()
        )
    }

    fn create_parser(&self) -> Box<dyn OutputParser> {
        parser::create_parser(self.output_format())
    }

    fn parse_output(&self, raw: &str) -> ParsedOutput {
        parser::parse_output(self.output_format(), raw)
    }
}

/// Create the provider for a kind
pub fn provider_for(kind: ProviderKind) -> Box<dyn AgentProvider> {
    match kind {
        ProviderKind::ClaudeApi => Box::new(ClaudeProvider::api_key()),
        ProviderKind::ClaudeOauth => Box::new(ClaudeProvider::oauth()),
        ProviderKind::Gemini => Box::new(GeminiProvider::user()),
        ProviderKind::GeminiAdmin => Box::new(GeminiProvider::admin()),
        ProviderKind::CodexApi => Box::new(CodexProvider::api_key()),
        ProviderKind::CodexOauth => Box::new(CodexProvider::oauth()),
    }
}
