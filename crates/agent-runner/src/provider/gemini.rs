use agentbox_core::ProviderKind;
use container_runtime::shell_quote;

use super::{AgentProvider, CommandOptions, CredentialSetup};
use crate::parser::OutputFormat;

/// Gemini CLI, keyed by the user or by the operator (admin)
pub struct GeminiProvider {
    admin: bool,
}

impl GeminiProvider {
    pub fn user() -> Self {
        Self { admin: false }
    }

    /// Operator-keyed variant used for internal helper prompts
    pub fn admin() -> Self {
        Self { admin: true }
    }
}

impl AgentProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        if self.admin {
            ProviderKind::GeminiAdmin
        } else {
            ProviderKind::Gemini
        }
    }

    fn name(&self) -> &'static str {
        if self.admin {
            "Gemini (admin)"
        } else {
            "Gemini"
        }
    }

    fn cli(&self) -> &'static str {
        "gemini"
    }

    fn install_command(&self) -> &'static str {
        "npm install -g @google/gemini-cli"
    }

    fn environment_setup(&self, secret: &str) -> CredentialSetup {
        CredentialSetup::EnvVar {
            name: "GEMINI_API_KEY",
            value: secret.to_string(),
        }
    }

    fn build_command(&self, options: &CommandOptions, prompt: &str) -> String {
        let mut args = vec!["gemini".to_string()];
        if let Some(model) = &options.model {
            args.push(format!("-m {}", shell_quote(model)));
        }
        if !self.admin {
            // Auto-approve tool use; helper prompts never need tools
            args.push("--yolo".to_string());
        }
        if options.verbose {
            args.push("--debug".to_string());
        }
        args.push(format!("-p {}", shell_quote(prompt)));
        args.join(" ")
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Text
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}
