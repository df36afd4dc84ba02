//! Kubernetes runtime: one pod per container handle

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::Client;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::output::OutputCollector;
use crate::runtime::{ContainerRuntime, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::shell::{export_prefix, redact_tokens, shell_quote};
use crate::types::{
    ContainerInfo, ContainerSpec, ContainerStatus, ExecOutput, ExecRequest, OutputLine,
    OutputStream, RuntimeKind, TIMEOUT_EXIT_CODE,
};

/// Waiting reasons after which a pending pod will not come up by itself
const ABNORMAL_WAIT_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Kubernetes connection and timing settings
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Kubeconfig context; the current context when unset
    pub context: Option<String>,
    /// Name of the single container inside each pod
    pub container_name: String,
    /// How long to wait for a new pod to become ready
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// Hard ceiling for any exec
    pub exec_timeout: Duration,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            context: None,
            container_name: "worker".to_string(),
            ready_timeout: Duration::from_secs(900),
            ready_poll_interval: Duration::from_secs(2),
            exec_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Container runtime running each container as a pod
pub struct KubernetesRuntime {
    client: Client,
    pods: Api<Pod>,
    config: KubernetesConfig,
}

impl KubernetesRuntime {
    /// Build a runtime from an existing client
    pub fn new(client: Client, config: KubernetesConfig) -> Self {
        let pods = Api::namespaced(client.clone(), &config.namespace);
        Self {
            client,
            pods,
            config,
        }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn connect(config: KubernetesConfig) -> Result<Self> {
        let client = match &config.context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.clone()),
                    ..Default::default()
                };
                let kube_config = kube::Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| RuntimeError::Unavailable {
                        reason: format!("kubeconfig context '{}': {}", context, e),
                    })?;
                Client::try_from(kube_config)?
            }
            None => Client::try_default().await?,
        };
        Ok(Self::new(client, config))
    }

    fn pod_manifest(&self, spec: &ContainerSpec) -> Result<Pod> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let env: Vec<serde_json::Value> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let mut limits = serde_json::Map::new();
        if let Some(cores) = spec.resources.cpu_cores {
            limits.insert("cpu".to_string(), json!(format!("{}m", (cores * 1000.0) as u64)));
        }
        if let Some(mb) = spec.resources.memory_mb {
            limits.insert("memory".to_string(), json!(format!("{}Mi", mb)));
        }

        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": spec.name,
                "labels": labels,
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": self.config.container_name,
                    "image": spec.image,
                    "workingDir": spec.working_dir,
                    "env": env,
                    "resources": { "limits": limits },
                }],
            },
        });

        Ok(serde_json::from_value(pod)?)
    }

    /// Poll until the pod is running with every container ready
    async fn wait_until_ready(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            let info = self.container_info(name).await?;
            match info {
                Some(info) if info.status.is_running() => {
                    if let Some(pod) = self.pods.get_opt(name).await? {
                        if all_containers_ready(&pod) {
                            return Ok(());
                        }
                    }
                }
                Some(info) if info.status.is_exited() || info.status.is_abnormal() => {
                    return Err(RuntimeError::creation_failed(format!(
                        "pod {} ended up {} before becoming ready",
                        name,
                        info.status.as_str()
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(RuntimeError::NotFound {
                        id: name.to_string(),
                    })
                }
            }

            if started.elapsed() >= self.config.ready_timeout {
                return Err(RuntimeError::Timeout {
                    what: format!("pod {} to become ready", name),
                    seconds: self.config.ready_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    async fn delete_pod(&self, name: &str, grace_seconds: u32) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_seconds),
            ..DeleteParams::default()
        };
        match self.pods.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Wrap a request into the script the pod runs, bounded by `ceiling`
fn exec_script(request: &ExecRequest, ceiling: Duration) -> String {
    let mut script = export_prefix(&request.env);
    if let Some(dir) = &request.working_dir {
        script.push_str(&format!("cd {} && ", shell_quote(dir)));
    }
    script.push_str(&request.command);

    let inner = match &request.user {
        Some(user) => format!(
            "su -s /bin/bash {} -c {}",
            shell_quote(user),
            shell_quote(&script)
        ),
        None => format!("bash -lc {}", shell_quote(&script)),
    };

    // coreutils timeout exits 124 when the ceiling fires
    format!("timeout --kill-after=10 {} {}", ceiling.as_secs(), inner)
}

/// Exit code carried by the exec status channel
fn exit_code_from_status(status: Option<&Status>) -> i64 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i64>().ok())
        })
        .unwrap_or(1)
}

fn all_containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
        .unwrap_or(false)
}

fn pod_status(pod: &Pod) -> (ContainerStatus, String) {
    if pod.metadata.deletion_timestamp.is_some() {
        return (ContainerStatus::Removing, "Terminating".to_string());
    }

    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    let normalized = match phase.as_str() {
        "Running" => ContainerStatus::Running,
        "Succeeded" => ContainerStatus::Succeeded,
        "Failed" => ContainerStatus::Failed,
        "Pending" => {
            let stuck = status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| {
                    statuses.iter().any(|c| {
                        c.state
                            .as_ref()
                            .and_then(|st| st.waiting.as_ref())
                            .and_then(|w| w.reason.as_deref())
                            .map(|reason| ABNORMAL_WAIT_REASONS.contains(&reason))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if stuck {
                ContainerStatus::PendingAbnormal
            } else {
                ContainerStatus::Pending
            }
        }
        _ => ContainerStatus::Unknown,
    };

    (normalized, phase)
}

fn info_from_pod(pod: &Pod) -> ContainerInfo {
    let (status, state) = pod_status(pod);
    let name = pod.metadata.name.clone().unwrap_or_default();
    ContainerInfo {
        id: name.clone(),
        name,
        status,
        state,
        labels: pod
            .metadata
            .labels
            .clone()
            .map(|l| l.into_iter().collect::<BTreeMap<_, _>>())
            .unwrap_or_default(),
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

/// Feed one attached stream into the shared collector until it closes.
///
/// Lines are read as raw bytes; invalid UTF-8 is decoded lossily by the
/// collector instead of ending the read.
async fn forward_stream<R>(reader: R, stream: OutputStream, collector: &Mutex<OutputCollector>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let mut collector = collector.lock().unwrap_or_else(PoisonError::into_inner);
                collector.push(stream, &line);
            }
            Err(e) => {
                warn!("Reading exec {:?} failed: {}", stream, e);
                break;
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for KubernetesRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Kubernetes
    }

    async fn is_available(&self) -> bool {
        self.client.apiserver_version().await.is_ok()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let pod = self.pod_manifest(spec)?;
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| RuntimeError::creation_failed(e.to_string()))?;
        info!("Created pod {} in namespace {}", spec.name, self.config.namespace);

        if let Err(e) = self.wait_until_ready(&spec.name).await {
            warn!("Pod {} did not become ready: {}", spec.name, e);
            let _ = self.delete_pod(&spec.name, 0).await;
            return Err(e);
        }

        Ok(spec.name.clone())
    }

    async fn run_exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
        lines: Option<mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<ExecOutput> {
        let ceiling = request
            .timeout
            .map(|t| t.min(self.config.exec_timeout))
            .unwrap_or(self.config.exec_timeout);
        let script = exec_script(request, ceiling);
        debug!("kubectl exec in {}: {}", container_id, redact_tokens(&request.command));

        let params = AttachParams::default()
            .container(self.config.container_name.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods
            .exec(container_id, vec!["bash".to_string(), "-c".to_string(), script], &params)
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 404 => RuntimeError::NotFound {
                    id: container_id.to_string(),
                },
                other => RuntimeError::exec_failed(other.to_string()),
            })?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| RuntimeError::exec_failed("stdout not attached"))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| RuntimeError::exec_failed("stderr not attached"))?;
        let status = attached
            .take_status()
            .ok_or_else(|| RuntimeError::exec_failed("status channel not attached"))?;

        let collector = Mutex::new(OutputCollector::new(lines));
        let completed = async {
            tokio::join!(
                forward_stream(stdout, OutputStream::Stdout, &collector),
                forward_stream(stderr, OutputStream::Stderr, &collector),
            );
            status.await
        };

        // The in-pod `timeout` normally fires first; this is the backstop
        let backstop = ceiling + Duration::from_secs(30);
        let finished = tokio::time::timeout(backstop, completed).await;
        let collector = collector.into_inner().unwrap_or_else(PoisonError::into_inner);
        match finished {
            Ok(status) => Ok(collector.finish(exit_code_from_status(status.as_ref()))),
            Err(_) => {
                warn!(
                    "Exec in pod {} exceeded {}s, abandoning",
                    container_id,
                    ceiling.as_secs()
                );
                attached.abort();
                let partial = collector.finish(TIMEOUT_EXIT_CODE);
                Ok(ExecOutput::timeout(partial.stdout, partial.stderr, ceiling))
            }
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        // Pods cannot be stopped without being deleted
        self.delete_pod(container_id, 10).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        self.delete_pod(container_id, if force { 0 } else { 10 }).await
    }

    async fn container_info(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let pod = self.pods.get_opt(container_id).await?;
        Ok(pod.as_ref().map(info_from_pod))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let pods = self.pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods
            .items
            .iter()
            .map(info_from_pod)
            .filter(|info| all || info.status.is_running())
            .collect())
    }

    async fn container_logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let params = LogParams {
            container: Some(self.config.container_name.clone()),
            tail_lines: Some(tail as i64),
            ..LogParams::default()
        };
        match self.pods.logs(container_id, &params).await {
            Ok(logs) => Ok(logs),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(RuntimeError::NotFound {
                id: container_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_exec_script_wraps_env_dir_and_ceiling() {
        let mut env = BTreeMap::new();
        env.insert("TOKEN".to_string(), "a b".to_string());
        let request = ExecRequest::new("git status --porcelain")
            .in_dir("/workspace/app/repo")
            .with_env(env);

        let script = exec_script(&request, Duration::from_secs(1800));
        assert!(script.starts_with("timeout --kill-after=10 1800 bash -lc "));
        assert!(script.contains("export TOKEN="));
        assert!(script.contains("cd /workspace/app/repo && git status --porcelain"));
    }

    #[test]
    fn test_exec_script_as_user() {
        let request = ExecRequest::new("whoami").as_user("agent");
        let script = exec_script(&request, Duration::from_secs(60));
        assert!(script.contains("su -s /bin/bash agent -c whoami"));
    }

    #[test]
    fn test_exit_code_from_status() {
        let success: Status = serde_json::from_value(json!({ "status": "Success" })).unwrap();
        assert_eq!(exit_code_from_status(Some(&success)), 0);

        let failure: Status = serde_json::from_value(json!({
            "status": "Failure",
            "reason": "NonZeroExitCode",
            "details": { "causes": [{ "reason": "ExitCode", "message": "124" }] }
        }))
        .unwrap();
        assert_eq!(exit_code_from_status(Some(&failure)), 124);
        assert_eq!(exit_code_from_status(None), -1);
    }

    #[test]
    fn test_pod_status_mapping() {
        let running = pod(json!({
            "metadata": { "name": "agentbox-a" },
            "status": { "phase": "Running" }
        }));
        assert_eq!(pod_status(&running).0, ContainerStatus::Running);

        let stuck = pod(json!({
            "metadata": { "name": "agentbox-b" },
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "worker", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                    "state": { "waiting": { "reason": "ImagePullBackOff" } }
                }]
            }
        }));
        assert_eq!(pod_status(&stuck).0, ContainerStatus::PendingAbnormal);

        let scheduling = pod(json!({
            "metadata": { "name": "agentbox-c" },
            "status": { "phase": "Pending" }
        }));
        assert_eq!(pod_status(&scheduling).0, ContainerStatus::Pending);

        let terminating = pod(json!({
            "metadata": { "name": "agentbox-d", "deletionTimestamp": "2024-01-01T00:00:00Z" },
            "status": { "phase": "Running" }
        }));
        assert_eq!(pod_status(&terminating).0, ContainerStatus::Removing);

        let done = pod(json!({
            "metadata": { "name": "agentbox-e" },
            "status": { "phase": "Succeeded" }
        }));
        assert!(pod_status(&done).0.is_exited());
    }

    #[test]
    fn test_all_containers_ready() {
        let ready = pod(json!({
            "metadata": { "name": "p" },
            "status": { "phase": "Running", "containerStatuses": [
                { "name": "worker", "image": "x", "imageID": "", "ready": true, "restartCount": 0 }
            ]}
        }));
        assert!(all_containers_ready(&ready));

        let no_statuses = pod(json!({ "metadata": { "name": "p" }, "status": { "phase": "Running" } }));
        assert!(!all_containers_ready(&no_statuses));
    }

    #[test]
    fn test_info_from_pod_labels() {
        let p = pod(json!({
            "metadata": {
                "name": "agentbox-x",
                "labels": { "app.kubernetes.io/managed-by": "agentbox" },
                "creationTimestamp": "2024-05-01T10:00:00Z"
            },
            "status": { "phase": "Failed" }
        }));
        let info = info_from_pod(&p);
        assert_eq!(info.id, "agentbox-x");
        assert_eq!(info.status, ContainerStatus::Failed);
        assert_eq!(info.state, "Failed");
        assert!(info.created_at.is_some());
        assert_eq!(info.labels.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_stream_survives_invalid_utf8() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = Mutex::new(OutputCollector::new(Some(tx)));
        let raw: &[u8] = b"first\nbad \xff\xfe line\nlast";

        forward_stream(raw, OutputStream::Stdout, &collector).await;

        let output = collector.into_inner().unwrap().finish(0);
        assert_eq!(rx.try_recv().unwrap().line, "first");
        assert_eq!(rx.try_recv().unwrap().line, "bad \u{fffd}\u{fffd} line");
        assert_eq!(rx.try_recv().unwrap().line, "last");
        assert!(output.stdout.ends_with("line\nlast"));
    }

    #[tokio::test]
    async fn test_forward_stream_interleaves_both_streams() {
        let collector = Mutex::new(OutputCollector::new(None));
        let out: &[u8] = b"caf\xc3\xa9\n";
        let err: &[u8] = b"warning\n";
        tokio::join!(
            forward_stream(out, OutputStream::Stdout, &collector),
            forward_stream(err, OutputStream::Stderr, &collector),
        );

        let output = collector.into_inner().unwrap().finish(0);
        assert_eq!(output.stdout, "café\n");
        assert_eq!(output.stderr, "warning\n");
    }
}
