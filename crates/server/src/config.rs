//! Server configuration, read once from the environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agent_runner::{GithubAppConfig, MonitorConfig, ProvisionerConfig, PublisherConfig};
use anyhow::{bail, Context, Result};
use container_runtime::{KubernetesConfig, RuntimeKind};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub runtime: RuntimeKind,
    pub kubernetes: KubernetesConfig,
    pub listen_addr: SocketAddr,
    pub cleanup_on_start: bool,
    pub github_app: Option<GithubAppConfig>,
    pub provisioner: ProvisionerConfig,
    pub publisher: PublisherConfig,
    pub monitor: MonitorConfig,
}

fn parse_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        None => default,
    }
}

fn parse_secs(name: &str, raw: Option<String>, default: u64) -> Result<Duration> {
    match raw {
        Some(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", name, raw))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default)),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and empty are the same
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let runtime = match var("AGENTBOX_RUNTIME") {
            Some(raw) => match RuntimeKind::from_str(&raw) {
                Some(kind) => kind,
                None => bail!("AGENTBOX_RUNTIME must be 'docker' or 'kubernetes', got '{}'", raw),
            },
            None => RuntimeKind::Docker,
        };

        let mut kubernetes = KubernetesConfig::default();
        if let Some(namespace) = var("AGENTBOX_K8S_NAMESPACE") {
            kubernetes.namespace = namespace;
        }
        kubernetes.context = var("AGENTBOX_K8S_CONTEXT");

        let listen_addr = var("AGENTBOX_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8081".to_string());
        let listen_addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("Invalid AGENTBOX_LISTEN_ADDR '{}'", listen_addr))?;

        let github_app = match var("GITHUB_APP_ID") {
            Some(app_id) => {
                let pem = match (var("GITHUB_APP_PRIVATE_KEY"), var("GITHUB_APP_PRIVATE_KEY_PATH")) {
                    (Some(pem), _) => pem.replace("\\n", "\n"),
                    (None, Some(path)) => std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read GitHub App key from {}", path))?,
                    (None, None) => bail!(
                        "GITHUB_APP_ID is set but neither GITHUB_APP_PRIVATE_KEY nor GITHUB_APP_PRIVATE_KEY_PATH is"
                    ),
                };
                let mut app = GithubAppConfig::new(app_id, pem);
                if let Some(api_url) = var("GITHUB_API_URL") {
                    app.api_url = api_url;
                }
                Some(app)
            }
            None => None,
        };

        let admin_gemini_api_key = var("AGENTBOX_ADMIN_GEMINI_API_KEY");

        let mut provisioner = ProvisionerConfig {
            admin_gemini_api_key: admin_gemini_api_key.clone(),
            ready_timeout: parse_secs("AGENTBOX_READY_TIMEOUT_SECS", var("AGENTBOX_READY_TIMEOUT_SECS"), 300)?,
            ..Default::default()
        };
        if let Some(image) = var("AGENTBOX_WORKER_IMAGE") {
            provisioner.worker_image = image;
        }

        let publisher = PublisherConfig {
            admin_gemini_api_key,
            auto_merge_delay: parse_secs(
                "AGENTBOX_AUTO_MERGE_DELAY_SECS",
                var("AGENTBOX_AUTO_MERGE_DELAY_SECS"),
                5,
            )?,
            ..Default::default()
        };

        let monitor = MonitorConfig {
            interval: parse_secs(
                "AGENTBOX_MONITOR_INTERVAL_SECS",
                var("AGENTBOX_MONITOR_INTERVAL_SECS"),
                60,
            )?,
            ..Default::default()
        };

        Ok(Self {
            data_dir: var("AGENTBOX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".agentbox-data")),
            runtime,
            kubernetes,
            listen_addr,
            cleanup_on_start: parse_flag(var("AGENTBOX_CLEANUP_ON_START"), true),
            github_app,
            provisioner,
            publisher,
            monitor,
        })
    }
}
