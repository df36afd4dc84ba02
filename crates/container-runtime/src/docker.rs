//! Docker runtime backed by the Engine API

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig};
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::output::OutputCollector;
use crate::runtime::{ContainerRuntime, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::shell::redact_tokens;
use crate::types::{
    ContainerInfo, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, OutputLine,
    OutputStream, RuntimeKind,
};

/// Seconds Docker waits before killing a stopping container
const STOP_GRACE_SECS: i64 = 10;

/// Container runtime talking to a Docker daemon
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Wrap an existing client
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the Docker daemon.
    ///
    /// Tries these locations in order:
    /// 1. `DOCKER_HOST` env var, then `/var/run/docker.sock` (bollard defaults)
    /// 2. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
    pub async fn connect() -> Result<Self> {
        if let Ok(docker) = Docker::connect_with_local_defaults() {
            if docker.ping().await.is_ok() {
                return Ok(Self::new(docker));
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let desktop_sock = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if desktop_sock.exists() {
                let sock_str = desktop_sock.to_string_lossy();
                if let Ok(docker) =
                    Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                {
                    if docker.ping().await.is_ok() {
                        return Ok(Self::new(docker));
                    }
                }
            }
        }

        Err(RuntimeError::Unavailable {
            reason: "no reachable Docker daemon (checked DOCKER_HOST and default sockets)"
                .to_string(),
        })
    }

    /// Pull the image unless it is already present locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling worker image: {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::creation_failed(format!(
                        "image pull failed: {}",
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_status(err: &BollardError, codes: &[u16]) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code)
    )
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn info_from_inspect(details: ContainerInspectResponse) -> ContainerInfo {
    let state = details
        .state
        .and_then(|s| s.status)
        .map(|s| s.to_string())
        .unwrap_or_default();
    let labels = details
        .config
        .and_then(|c| c.labels)
        .map(|l| l.into_iter().collect())
        .unwrap_or_default();

    ContainerInfo {
        id: details.id.unwrap_or_default(),
        name: details
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status: ContainerStatus::from_docker_state(&state),
        state,
        labels,
        created_at: details.created.as_deref().and_then(parse_rfc3339),
    }
}

fn info_from_summary(summary: ContainerSummary) -> ContainerInfo {
    let state = summary.state.unwrap_or_default();
    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status: ContainerStatus::from_docker_state(&state),
        state,
        labels: summary
            .labels
            .map(|l| l.into_iter().collect())
            .unwrap_or_default(),
        created_at: summary
            .created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let mut labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let host_config = HostConfig {
            memory: spec.resources.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            nano_cpus: spec
                .resources
                .cpu_cores
                .map(|cores| (cores * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env_list(&spec.env)),
            labels: Some(labels),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::creation_failed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::creation_failed(format!("start failed: {}", e)))?;

        info!("Started container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn run_exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<ExecOutput> {
        debug!(
            "docker exec in {}: {}",
            container_id,
            redact_tokens(&request.command)
        );

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "bash".to_string(),
                        "-lc".to_string(),
                        request.command.clone(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    env: Some(env_list(&request.env)),
                    user: request.user.clone(),
                    working_dir: request.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                if is_status(&e, &[404]) {
                    RuntimeError::NotFound {
                        id: container_id.to_string(),
                    }
                } else {
                    RuntimeError::exec_failed(format!("exec create failed: {}", e))
                }
            })?;

        let mut collector = OutputCollector::new(lines);

        let read = async {
            let started = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| RuntimeError::exec_failed(format!("exec start failed: {}", e)))?;

            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            collector.push(OutputStream::Stdout, &message)
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            collector.push(OutputStream::Stderr, &message)
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(RuntimeError::exec_failed(format!(
                                "exec stream failed: {}",
                                e
                            )))
                        }
                    }
                }
            }
            Ok::<(), RuntimeError>(())
        };

        // Docker execs have no ceiling of their own; only a caller-imposed one
        let finished = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, read).await.ok(),
            None => Some(read.await),
        };
        match (finished, request.timeout) {
            (Some(result), _) => result?,
            (None, limit) => {
                let (stdout, stderr) = collector.snapshot();
                return Ok(ExecOutput::timeout(stdout, stderr, limit.unwrap_or_default()));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::exec_failed(format!("exec inspect failed: {}", e)))?;

        Ok(collector.finish(inspect.exit_code.unwrap_or(-1)))
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn container_info(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(Some(info_from_inspect(details))),
            Err(e) if is_status(&e, &[404]) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)],
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries.into_iter().map(info_from_summary).collect())
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut logs = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    logs.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) if is_status(&e, &[404]) => {
                    return Err(RuntimeError::NotFound {
                        id: container_id.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(logs)
    }
}
