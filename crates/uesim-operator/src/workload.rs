//! Workload Client
//!
//! Abstraction over the managed UE workload container: readiness probing,
//! config file push/pull, service restart and on-demand command execution.
//! The production implementation drives the container over the pod exec
//! subresource; the image ships a small supervisor CLI (`ue-supervisor`)
//! that manages the `nr-ue` process.
//!
//! All operations are fallible and surface typed errors; none swallows a
//! failure, since the reconciler's correctness depends on accurate
//! readiness and error signals. Long-running calls carry an explicit
//! client-side timeout plus an in-container `timeout(1)` guard so a hung
//! command is never left in an ambiguous state.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use uesim_common::{Error, Result, UE_CONFIG_PATH, UE_CONTAINER_NAME, UE_SERVICE_NAME};

use crate::render::fingerprint;

/// Supervisor CLI shipped in the workload image
const UE_SUPERVISOR: &str = "ue-supervisor";

/// Exit code the in-container `timeout(1)` guard reports on expiry
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Whether the workload container can currently accept file pushes and
/// service commands.
///
/// Derived fresh on each check; never cached across reconciliation passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadReadiness {
    /// Container is not running or not ready yet
    NotReady,
    /// Container is running and ready for exec operations
    Ready,
    /// Readiness could not be determined within the probe timeout
    Unknown,
}

/// Captured output of an ad-hoc workload command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Whether the command exited successfully
    pub success: bool,
    /// Exit code, when the workload reported one
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Trait abstracting the workload container's service interface.
///
/// Allows mocking the container in tests while the real implementation
/// uses pod exec.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Probe whether the workload container accepts commands.
    ///
    /// Never blocks longer than the bounded probe timeout; returns
    /// `Unknown` on timeout rather than hanging the reconciliation loop.
    async fn is_ready(&self, namespace: &str, pod: &str) -> WorkloadReadiness;

    /// Fingerprint of the config file currently present in the workload.
    ///
    /// `None` if the file is absent.
    async fn read_config_fingerprint(&self, namespace: &str, pod: &str)
        -> Result<Option<String>>;

    /// Push new config file content.
    ///
    /// Atomic from the caller's perspective: the previous content remains
    /// readable until the write fully succeeds (tmp file + rename).
    async fn write_config(&self, namespace: &str, pod: &str, content: &str) -> Result<()>;

    /// Restart the managed UE service so it picks up new configuration.
    ///
    /// A no-op on the workload side when the service is not running.
    async fn restart_service(&self, namespace: &str, pod: &str) -> Result<()>;

    /// Start the UE and wait for the attach/registration procedure.
    ///
    /// Long-running relative to the other calls; cut off by the action
    /// timeout, in which case an explicit timeout error is returned.
    async fn run_start_ue(&self, namespace: &str, pod: &str) -> Result<ActionOutput>;

    /// Stop the UE service.
    async fn run_stop_ue(&self, namespace: &str, pod: &str) -> Result<ActionOutput>;
}

/// Production implementation over the pod exec subresource.
pub struct PodWorkloadClient {
    client: Client,
    container: String,
    config_path: String,
    probe_timeout: Duration,
    exec_timeout: Duration,
    action_timeout: Duration,
}

impl PodWorkloadClient {
    /// Create a client with the default container name, config path and
    /// timeouts.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            container: UE_CONTAINER_NAME.to_string(),
            config_path: UE_CONFIG_PATH.to_string(),
            probe_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(120),
        }
    }

    /// Override the start-ue action timeout
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run a command in the workload container, capturing output and exit
    /// code, bounded by `timeout`.
    async fn exec_capture(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        stdin: Option<String>,
        timeout: Duration,
    ) -> std::result::Result<ActionOutput, ExecFailure> {
        let fut = self.exec_capture_inner(namespace, pod, command, stdin);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExecFailure::TimedOut(timeout)),
        }
    }

    async fn exec_capture_inner(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        stdin: Option<String>,
    ) -> std::result::Result<ActionOutput, ExecFailure> {
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods(namespace)
            .exec(pod, command, &params)
            .await
            .map_err(|e| ExecFailure::Transport(format!("exec failed: {}", e)))?;

        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();
        let stdin_writer = attached.stdin();

        // Write stdin and drain stdout/stderr concurrently so a full pipe
        // buffer cannot deadlock the exchange.
        let write = async {
            if let (Some(input), Some(mut writer)) = (stdin, stdin_writer) {
                writer.write_all(input.as_bytes()).await?;
                writer.flush().await?;
                // Dropping the writer closes the stream so the remote
                // command sees EOF.
                drop(writer);
            }
            Ok::<_, std::io::Error>(())
        };
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(reader) = stdout_reader.as_mut() {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (write_result, stdout_buf, stderr_buf) = tokio::join!(write, read_out, read_err);
        write_result.map_err(|e| ExecFailure::Transport(format!("stdin write failed: {}", e)))?;
        let stdout_buf =
            stdout_buf.map_err(|e| ExecFailure::Transport(format!("stdout read failed: {}", e)))?;
        let stderr_buf =
            stderr_buf.map_err(|e| ExecFailure::Transport(format!("stderr read failed: {}", e)))?;

        // The K8s exec protocol reports the command result as a Status
        // object on the error channel at session end.
        let exit_code = match attached.take_status() {
            Some(status_future) => status_future.await.as_ref().and_then(exit_code_of),
            None => None,
        };

        Ok(ActionOutput {
            success: exit_code == Some(0),
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        })
    }
}

/// Internal exec failure, mapped to a typed error per operation.
#[derive(Debug)]
enum ExecFailure {
    TimedOut(Duration),
    Transport(String),
}

impl std::fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut(t) => write!(f, "timed out after {}s", t.as_secs()),
            Self::Transport(msg) => write!(f, "{}", msg),
        }
    }
}

/// Extract the command exit code from the exec Status object.
///
/// Success means exit 0; failures carry the code in
/// `details.causes[reason=ExitCode].message`.
fn exit_code_of(status: &Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|c| c.reason.as_deref() == Some("ExitCode"))
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
}

/// Derive workload readiness from an observed pod.
fn readiness_of(pod: &Pod, container: &str) -> WorkloadReadiness {
    let status = match pod.status.as_ref() {
        Some(s) => s,
        None => return WorkloadReadiness::NotReady,
    };
    if status.phase.as_deref() != Some("Running") {
        return WorkloadReadiness::NotReady;
    }
    let ready = status
        .container_statuses
        .as_ref()
        .and_then(|statuses| statuses.iter().find(|c| c.name == container))
        .map(|c| c.ready)
        .unwrap_or(false);
    if ready {
        WorkloadReadiness::Ready
    } else {
        WorkloadReadiness::NotReady
    }
}

#[async_trait]
impl WorkloadClient for PodWorkloadClient {
    async fn is_ready(&self, namespace: &str, pod: &str) -> WorkloadReadiness {
        match tokio::time::timeout(self.probe_timeout, self.pods(namespace).get_opt(pod)).await {
            Err(_) => {
                warn!(pod, "readiness probe timed out");
                WorkloadReadiness::Unknown
            }
            Ok(Err(e)) => {
                warn!(pod, error = %e, "readiness probe failed");
                WorkloadReadiness::Unknown
            }
            Ok(Ok(None)) => WorkloadReadiness::NotReady,
            Ok(Ok(Some(pod_obj))) => readiness_of(&pod_obj, &self.container),
        }
    }

    async fn read_config_fingerprint(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Option<String>> {
        let command = vec!["cat".to_string(), self.config_path.clone()];
        let output = self
            .exec_capture(namespace, pod, command, None, self.exec_timeout)
            .await
            .map_err(|e| Error::internal_with_context("exec", e.to_string()))?;

        if output.success {
            Ok(Some(fingerprint(&output.stdout)))
        } else {
            // cat exits non-zero when the file does not exist yet
            debug!(pod, path = %self.config_path, "config file not present");
            Ok(None)
        }
    }

    async fn write_config(&self, namespace: &str, pod: &str, content: &str) -> Result<()> {
        // Write to a temp file and rename so the old config stays readable
        // until the new one is fully in place.
        let script = format!(
            "umask 077 && cat > '{path}.tmp' && mv '{path}.tmp' '{path}'",
            path = self.config_path
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let output = self
            .exec_capture(
                namespace,
                pod,
                command,
                Some(content.to_string()),
                self.exec_timeout,
            )
            .await
            .map_err(|e| Error::write(&self.config_path, e.to_string()))?;

        if !output.success {
            return Err(Error::write(
                &self.config_path,
                format!(
                    "exit code {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        debug!(pod, path = %self.config_path, "config file written");
        Ok(())
    }

    async fn restart_service(&self, namespace: &str, pod: &str) -> Result<()> {
        let command = vec![UE_SUPERVISOR.to_string(), "restart".to_string()];
        let output = self
            .exec_capture(namespace, pod, command, None, self.exec_timeout)
            .await
            .map_err(|e| Error::restart(UE_SERVICE_NAME, e.to_string()))?;

        if !output.success {
            return Err(Error::restart(
                UE_SERVICE_NAME,
                format!(
                    "exit code {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        debug!(pod, "UE service restarted");
        Ok(())
    }

    async fn run_start_ue(&self, namespace: &str, pod: &str) -> Result<ActionOutput> {
        // The in-container timeout guard expires slightly before the
        // client-side one so the process ends in a defined state.
        let guard_secs = self.action_timeout.as_secs().saturating_sub(5).max(1);
        let script = format!("timeout {}s {} start --wait", guard_secs, UE_SUPERVISOR);
        let command = vec!["sh".to_string(), "-c".to_string(), script];

        let output = self
            .exec_capture(namespace, pod, command, None, self.action_timeout)
            .await
            .map_err(|e| match e {
                ExecFailure::TimedOut(_) => Error::action_timeout("start-ue", e.to_string()),
                ExecFailure::Transport(msg) => Error::action("start-ue", msg),
            })?;

        if output.exit_code == Some(TIMEOUT_EXIT_CODE) {
            return Err(Error::action_timeout(
                "start-ue",
                format!("UE registration did not complete within {}s", guard_secs),
            ));
        }
        Ok(output)
    }

    async fn run_stop_ue(&self, namespace: &str, pod: &str) -> Result<ActionOutput> {
        let command = vec![UE_SUPERVISOR.to_string(), "stop".to_string()];
        self.exec_capture(namespace, pod, command, None, self.exec_timeout)
            .await
            .map_err(|e| match e {
                ExecFailure::TimedOut(_) => Error::action_timeout("stop-ue", e.to_string()),
                ExecFailure::Transport(msg) => Error::action("stop-ue", msg),
            })
    }
}
