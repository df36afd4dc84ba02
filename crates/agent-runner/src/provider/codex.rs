use agentbox_core::ProviderKind;
use container_runtime::shell_quote;

use super::{AgentProvider, CommandOptions, CredentialSetup};
use crate::parser::OutputFormat;

/// Codex CLI, authenticated by API key or an OAuth `auth.json`
pub struct CodexProvider {
    oauth: bool,
}

impl CodexProvider {
    pub fn api_key() -> Self {
        Self { oauth: false }
    }

    pub fn oauth() -> Self {
        Self { oauth: true }
    }
}

impl AgentProvider for CodexProvider {
    fn kind(&self) -> ProviderKind {
        if self.oauth {
            ProviderKind::CodexOauth
        } else {
            ProviderKind::CodexApi
        }
    }

    fn name(&self) -> &'static str {
        if self.oauth {
            "Codex (OAuth)"
        } else {
            "Codex"
        }
    }

    fn cli(&self) -> &'static str {
        "codex"
    }

    fn install_command(&self) -> &'static str {
        "npm install -g @openai/codex"
    }

    fn environment_setup(&self, secret: &str) -> CredentialSetup {
        if self.oauth {
            CredentialSetup::AuthFile {
                path: ".codex/auth.json",
                contents: secret.to_string(),
            }
        } else {
            CredentialSetup::EnvVar {
                name: "OPENAI_API_KEY",
                value: secret.to_string(),
            }
        }
    }

    fn build_command(&self, options: &CommandOptions, prompt: &str) -> String {
        let mut args = vec![
            "codex exec".to_string(),
            "--skip-git-repo-check".to_string(),
            "--dangerously-bypass-approvals-and-sandbox".to_string(),
        ];
        if let Some(model) = &options.model {
            args.push(format!("-m {}", shell_quote(model)));
        }
        for (key, value) in &options.config_overrides {
            args.push(format!("-c {}", shell_quote(&format!("{}={}", key, value))));
        }
        args.push(shell_quote(prompt));
        args.join(" ")
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::BlockLog
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
