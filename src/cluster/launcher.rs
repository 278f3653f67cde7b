//! Hooks for starting and stopping node processes.

use crate::config::{NodeConfig, RetryConfig};
use crate::error::{ClusterError, Result};
use crate::node::{KvNode, KvNodeHandle, NodeController};
use crate::types::ServerIdentity;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long `terminate` waits for a node to exit.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts a storage node on a machine.
///
/// A launched node listens on the machine's address and port, starts
/// Stopped and waits for INIT. `terminate` is only used to clean up after a
/// failed join or a node that ignored SHUTDOWN.
#[async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    /// Launch a node on the machine.
    async fn launch(&self, machine: &ServerIdentity) -> Result<()>;

    /// Forcefully stop the node on the machine, if any.
    async fn terminate(&self, machine: &ServerIdentity) -> Result<()>;
}

/// Runs nodes as tasks inside the current runtime.
#[derive(Default)]
pub struct InProcessLauncher {
    /// Retry policy handed to launched nodes.
    retry: RetryConfig,

    /// Migration batch size override.
    transfer_batch_bytes: Option<usize>,

    /// Running nodes by machine.
    nodes: Mutex<HashMap<ServerIdentity, KvNodeHandle>>,
}

impl InProcessLauncher {
    /// Create a launcher with default node settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy for launched nodes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the migration batch size for launched nodes.
    pub fn with_transfer_batch_bytes(mut self, bytes: usize) -> Self {
        self.transfer_batch_bytes = Some(bytes);
        self
    }

    /// The controller of a node launched on `machine`.
    pub fn node(&self, machine: &ServerIdentity) -> Option<Arc<NodeController>> {
        self.nodes
            .lock()
            .get(machine)
            .map(|handle| handle.controller().clone())
    }

    /// Machines whose node is still accepting connections.
    pub fn running(&self) -> Vec<ServerIdentity> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(machine, _)| machine.clone())
            .collect()
    }
}

#[async_trait]
impl NodeLauncher for InProcessLauncher {
    async fn launch(&self, machine: &ServerIdentity) -> Result<()> {
        let mut config = NodeConfig::new(machine.clone()).with_retry(self.retry.clone());
        if let Some(bytes) = self.transfer_batch_bytes {
            config = config.with_transfer_batch_bytes(bytes);
        }

        let handle = KvNode::start(config)
            .await
            .map_err(|e| ClusterError::LaunchFailed {
                node: machine.to_string(),
                reason: e.to_string(),
            })?;

        // A stale handle from a previous run on the same machine is dropped.
        self.nodes.lock().insert(machine.clone(), handle);
        debug!(node = %machine, "Launched in-process node");
        Ok(())
    }

    async fn terminate(&self, machine: &ServerIdentity) -> Result<()> {
        let handle = self.nodes.lock().remove(machine);
        if let Some(handle) = handle {
            handle.shutdown();
            if tokio::time::timeout(TERMINATE_TIMEOUT, handle.wait())
                .await
                .is_err()
            {
                warn!(node = %machine, "Node did not exit in time");
            }
        }
        Ok(())
    }
}

/// Spawns each node as a child process.
///
/// Arguments may contain `{name}`, `{address}` and `{port}`, which are
/// replaced with the machine's values.
pub struct ProcessLauncher {
    /// Node executable.
    program: String,

    /// Argument template.
    args: Vec<String>,

    /// Children by machine.
    children: Mutex<HashMap<ServerIdentity, Child>>,
}

impl ProcessLauncher {
    /// Launch `program` with the default `kvnode` argument template.
    pub fn new(program: impl Into<String>) -> Self {
        let args = [
            "--name", "{name}", "--address", "{address}", "--port", "{port}",
        ];
        Self::with_args(program, args.iter().map(|a| a.to_string()).collect())
    }

    /// Launch `program` with a custom argument template.
    pub fn with_args(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Arguments for a machine.
    pub fn render_args(&self, machine: &ServerIdentity) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{name}", &machine.name)
                    .replace("{address}", &machine.address)
                    .replace("{port}", &machine.port.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    async fn launch(&self, machine: &ServerIdentity) -> Result<()> {
        let args = self.render_args(machine);
        let child = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::LaunchFailed {
                node: machine.to_string(),
                reason: e.to_string(),
            })?;

        info!(node = %machine, program = %self.program, pid = ?child.id(), "Spawned node process");
        self.children.lock().insert(machine.clone(), child);
        Ok(())
    }

    async fn terminate(&self, machine: &ServerIdentity) -> Result<()> {
        let child = self.children.lock().remove(machine);
        if let Some(mut child) = child {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(node = %machine, %status, "Node process already exited");
                return Ok(());
            }
            if let Err(e) = child.kill().await {
                warn!(node = %machine, error = %e, "Failed to kill node process");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args() {
        let launcher = ProcessLauncher::new("kvnode");
        let machine = ServerIdentity::new("server1", "10.0.0.1", 50000);
        assert_eq!(
            launcher.render_args(&machine),
            vec![
                "--name", "server1", "--address", "10.0.0.1", "--port", "50000"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_launch() {
        let launcher = ProcessLauncher::new("/nonexistent/kvnode");
        let machine = ServerIdentity::new("server1", "127.0.0.1", 50000);
        let err = launcher.launch(&machine).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Cluster(ClusterError::LaunchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_process_launch_and_terminate() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let launcher = InProcessLauncher::new();
        let machine = ServerIdentity::new("n1", "127.0.0.1", port);

        launcher.launch(&machine).await.unwrap();
        assert!(launcher.node(&machine).is_some());
        assert_eq!(launcher.running(), vec![machine.clone()]);

        launcher.terminate(&machine).await.unwrap();
        assert!(launcher.node(&machine).is_none());
        assert!(launcher.running().is_empty());
    }
}
