//! Per-user credentials
//!
//! Secrets arrive here already decrypted by the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::ProviderKind;

/// GitHub identity and app installations of a user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubIdentity {
    #[serde(default)]
    pub installation_ids: Vec<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: Uuid,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub claude_oauth_token: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    /// Raw `auth.json` blob of a Codex OAuth login
    #[serde(default)]
    pub codex_oauth_json: Option<String>,
    #[serde(default)]
    pub github: GithubIdentity,
}

impl Credentials {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            anthropic_api_key: None,
            claude_oauth_token: None,
            gemini_api_key: None,
            openai_api_key: None,
            codex_oauth_json: None,
            github: GithubIdentity::default(),
        }
    }

    /// The user's secret for a provider, if any.
    ///
    /// `GeminiAdmin` is operator-keyed and never resolved from user credentials.
    pub fn secret_for(&self, provider: ProviderKind) -> Option<&str> {
        let secret = match provider {
            ProviderKind::ClaudeApi => self.anthropic_api_key.as_deref(),
            ProviderKind::ClaudeOauth => self.claude_oauth_token.as_deref(),
            ProviderKind::Gemini => self.gemini_api_key.as_deref(),
            ProviderKind::GeminiAdmin => None,
            ProviderKind::CodexApi => self.openai_api_key.as_deref(),
            ProviderKind::CodexOauth => self.codex_oauth_json.as_deref(),
        };
        secret.filter(|s| !s.trim().is_empty())
    }

    /// Git author name, falling back to a bot identity
    pub fn git_name(&self) -> &str {
        self.github.name.as_deref().unwrap_or("Agentbox")
    }

    /// Git author email, falling back to a bot identity
    pub fn git_email(&self) -> &str {
        self.github.email.as_deref().unwrap_or("agentbox@users.noreply.github.com")
    }
}
