//! Remote command execution inside node containers
//!
//! The operator talks to repmgr through its CLI. Commands run in the node's
//! pod via the Kubernetes exec API, wrapped in the image's shell entrypoint
//! so the container environment (passwords, config path) is in place.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::resources::common::{node_label_selector, SHELL_ENTRYPOINT};

/// Name of the PostgreSQL container in every node pod
pub const CONTAINER_NAME: &str = "postgresql";

/// Errors that can occur while running a remote command
#[derive(Error, Debug)]
pub enum ExecError {
    /// No running pod backs the node
    #[error("No running pod found for node {0}")]
    NoPod(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The command exited unsuccessfully
    #[error("Command {command:?} failed: {message} (stdout: {stdout:?}, stderr: {stderr:?})")]
    CommandFailed {
        command: Vec<String>,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The command did not finish in time
    #[error("Command {command:?} timed out after {timeout:?}")]
    Timeout {
        command: Vec<String>,
        timeout: Duration,
    },

    /// IO error on the exec streams
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Captured output of a successful command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands inside a node's container
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` in the container backing `node_name` and capture its output
    async fn exec(&self, node_name: &str, command: Vec<String>) -> Result<ExecOutput, ExecError>;
}

/// Operation a node performs against the repmgr cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupOperation {
    /// Register the node as the cluster primary
    PrimaryRegister,
    /// Register the node as a standby of the current primary
    StandbyRegister,
    /// Rejoin a node that was already a cluster member
    NodeRejoin,
}

impl StartupOperation {
    /// The repmgr subcommand words for this operation
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupOperation::PrimaryRegister => "primary register",
            StartupOperation::StandbyRegister => "standby register",
            StartupOperation::NodeRejoin => "node rejoin",
        }
    }
}

impl fmt::Display for StartupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command that registers a node with repmgr
pub fn register_command(operation: StartupOperation) -> Vec<String> {
    let mut command = vec![SHELL_ENTRYPOINT.to_string(), "repmgr".to_string()];
    command.extend(operation.as_str().split(' ').map(str::to_string));
    command
}

/// Command that asks repmgr whether the local node is healthy
pub fn node_check_command() -> Vec<String> {
    vec![
        SHELL_ENTRYPOINT.to_string(),
        "repmgr".to_string(),
        "node".to_string(),
        "check".to_string(),
    ]
}

/// Whether `repmgr node check` output reports a registered node
pub fn node_check_passed(output: &ExecOutput) -> bool {
    output.stdout.contains("OK")
}

/// Executes commands in node pods via the Kubernetes exec API
pub struct PodExecutor {
    pods: Api<Pod>,
    cluster_name: String,
    timeout: Duration,
}

impl PodExecutor {
    pub fn new(client: Client, namespace: &str, cluster_name: &str, timeout: Duration) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            cluster_name: cluster_name.to_string(),
            timeout,
        }
    }

    /// Find the running pod of a node's Deployment
    async fn find_pod(&self, node_name: &str) -> Result<String, ExecError> {
        let lp = ListParams::default().labels(&node_label_selector(&self.cluster_name, node_name));
        let pods = self.pods.list(&lp).await?;

        pods.items
            .into_iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| ExecError::NoPod(node_name.to_string()))
    }

    async fn exec_in_pod(&self, pod_name: &str, command: Vec<String>) -> Result<ExecOutput, ExecError> {
        let attach_params = AttachParams {
            container: Some(CONTAINER_NAME.to_string()),
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let mut attached = self.pods.exec(pod_name, command.clone(), &attach_params).await?;

        // Close stdin to signal end of input
        if let Some(mut stdin) = attached.stdin() {
            stdin.shutdown().await?;
        }

        let stdout = attached.stdout().ok_or_else(|| ExecError::CommandFailed {
            command: command.clone(),
            message: "no stdout stream".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        })?;
        let stderr = attached.stderr().ok_or_else(|| ExecError::CommandFailed {
            command: command.clone(),
            message: "no stderr stream".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        })?;

        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        if let Some(status) = status {
            if status.status.as_deref() != Some("Success") {
                return Err(ExecError::CommandFailed {
                    command,
                    message: status
                        .message
                        .unwrap_or_else(|| format!("exit status {:?}", status.status)),
                    stdout,
                    stderr,
                });
            }
        }

        Ok(ExecOutput { stdout, stderr })
    }
}

#[async_trait]
impl RemoteExecutor for PodExecutor {
    async fn exec(&self, node_name: &str, command: Vec<String>) -> Result<ExecOutput, ExecError> {
        let pod_name = self.find_pod(node_name).await?;
        debug!(node = node_name, pod = %pod_name, ?command, "Executing remote command");

        match tokio::time::timeout(self.timeout, self.exec_in_pod(&pod_name, command.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout {
                command,
                timeout: self.timeout,
            }),
        }
    }
}

/// Read all data from an async read stream
async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> Result<String, ExecError> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
