use crate::cluster::{
    ClusterController, ClusterEventListener, InProcessLauncher, MachineRepository, NodeLauncher,
};
use crate::config::{ControllerConfig, NodeConfig, RetryConfig};
use crate::error::{ClusterError, Result};
use crate::network::rpc::{Message, PeerRequest, PeerResponse};
use crate::network::server::{MessageHandler, NetworkServer};
use crate::node::NodeController;
use crate::types::ServerIdentity;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Allocate OS-assigned ports by briefly binding to port 0.
pub(crate) async fn allocate_os_ports(count: usize) -> Vec<u16> {
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(listener.local_addr().unwrap().port());
        drop(listener);
    }
    ports
}

/// Retry policy that gives up quickly on dead nodes.
pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_max_attempts(3)
        .with_initial_backoff(Duration::from_millis(20))
        .with_request_timeout(Duration::from_secs(5))
}

/// Controller settings for tests: fast retries, no launch grace.
pub(crate) fn test_controller_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_retry(fast_retry())
        .with_launch_grace(Duration::ZERO)
        .with_migration_timeout(Duration::from_secs(10))
        .with_resolve_timeout(Duration::from_secs(10))
}

/// Wait for a condition with timeout.
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    false
}

/// A launcher whose nodes run in the test runtime and can be inspected.
pub(crate) trait LocalLauncher: NodeLauncher {
    /// The controller of the node launched on `machine`.
    fn node(&self, machine: &ServerIdentity) -> Option<Arc<NodeController>>;

    /// Machines whose node is still accepting connections.
    fn running(&self) -> Vec<ServerIdentity>;
}

impl LocalLauncher for InProcessLauncher {
    fn node(&self, machine: &ServerIdentity) -> Option<Arc<NodeController>> {
        InProcessLauncher::node(self, machine)
    }

    fn running(&self) -> Vec<ServerIdentity> {
        InProcessLauncher::running(self)
    }
}

/// Misbehaviour of a node receiving migration batches.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PeerFault {
    /// Hold every batch this long before applying it.
    Delay(Duration),
    /// Apply the first `n` batches, reject every later one.
    RejectBatchesAfter(usize),
}

/// Launches nodes whose peer channel misbehaves on `SERVER_PUT_ALL`.
///
/// Control commands are applied one at a time like on a real node; client
/// requests and other peer messages are served normally.
pub(crate) struct FaultyPeerLauncher {
    fault: PeerFault,
    transfer_batch_bytes: Option<usize>,
    nodes: Mutex<HashMap<ServerIdentity, FaultyNode>>,
}

struct FaultyNode {
    controller: Arc<NodeController>,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<()>,
}

impl FaultyPeerLauncher {
    pub fn new(fault: PeerFault) -> Self {
        Self {
            fault,
            transfer_batch_bytes: None,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Set the migration batch size for launched nodes.
    pub fn with_transfer_batch_bytes(mut self, bytes: usize) -> Self {
        self.transfer_batch_bytes = Some(bytes);
        self
    }
}

#[async_trait]
impl NodeLauncher for FaultyPeerLauncher {
    async fn launch(&self, machine: &ServerIdentity) -> Result<()> {
        let mut config = NodeConfig::new(machine.clone()).with_retry(fast_retry());
        if let Some(bytes) = self.transfer_batch_bytes {
            config = config.with_transfer_batch_bytes(bytes);
        }

        let controller = Arc::new(NodeController::new(&config));
        let handler = FaultyHandler {
            controller: controller.clone(),
            control: tokio::sync::Mutex::new(()),
            fault: self.fault,
            batches: AtomicUsize::new(0),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = NetworkServer::bind(
            &config.listen_endpoint(),
            Arc::new(handler),
            config.max_message_size,
            shutdown_rx,
        )
        .await
        .map_err(|e| ClusterError::LaunchFailed {
            node: machine.to_string(),
            reason: e.to_string(),
        })?;
        let server = tokio::spawn(async move {
            let _ = server.run().await;
        });

        self.nodes.lock().insert(
            machine.clone(),
            FaultyNode {
                controller,
                shutdown_tx,
                server,
            },
        );
        Ok(())
    }

    async fn terminate(&self, machine: &ServerIdentity) -> Result<()> {
        let node = self.nodes.lock().remove(machine);
        if let Some(node) = node {
            node.shutdown_tx.send_replace(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), node.server).await;
        }
        Ok(())
    }
}

impl LocalLauncher for FaultyPeerLauncher {
    fn node(&self, machine: &ServerIdentity) -> Option<Arc<NodeController>> {
        self.nodes
            .lock()
            .get(machine)
            .map(|node| node.controller.clone())
    }

    fn running(&self) -> Vec<ServerIdentity> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, node)| !node.server.is_finished())
            .map(|(machine, _)| machine.clone())
            .collect()
    }
}

struct FaultyHandler {
    controller: Arc<NodeController>,
    control: tokio::sync::Mutex<()>,
    fault: PeerFault,
    batches: AtomicUsize,
}

#[async_trait]
impl MessageHandler for FaultyHandler {
    async fn handle(&self, msg: Message) -> Message {
        match msg {
            Message::Control(request) => {
                let _serial = self.control.lock().await;
                Message::ControlReply(self.controller.handle_control(request).await)
            }
            Message::Peer(request @ PeerRequest::PutAll(_)) => {
                match self.fault {
                    PeerFault::Delay(delay) => sleep(delay).await,
                    PeerFault::RejectBatchesAfter(limit) => {
                        if self.batches.fetch_add(1, Ordering::SeqCst) >= limit {
                            return Message::PeerReply(PeerResponse::Failed {
                                reason: "batch rejected".to_string(),
                            });
                        }
                    }
                }
                Message::PeerReply(self.controller.handle_peer(request))
            }
            Message::Peer(request) => Message::PeerReply(self.controller.handle_peer(request)),
            Message::Client(request) => {
                Message::ClientReply(self.controller.handle_client(request))
            }
            other => Message::Failed(format!("not a request: {:?}", other)),
        }
    }
}

/// A controller over a pool of local machines, with its nodes running in
/// the test runtime.
pub(crate) struct TestCluster<L = InProcessLauncher> {
    pub controller: ClusterController,
    pub launcher: Arc<L>,
    pub machines: Vec<ServerIdentity>,
}

impl TestCluster<InProcessLauncher> {
    /// A pool of `machines` local machines; nothing is launched yet.
    pub async fn with_pool(machines: usize) -> Self {
        Self::with_launcher(machines, InProcessLauncher::new()).await
    }

    /// Like [`with_pool`](Self::with_pool) with a preconfigured launcher.
    pub async fn with_launcher(machines: usize, launcher: InProcessLauncher) -> Self {
        let launcher = launcher.with_retry(fast_retry());
        TestCluster::with_config(machines, launcher, test_controller_config()).await
    }

    /// Initialize `nodes` nodes out of a pool of `machines` and start them.
    pub async fn running(nodes: usize, machines: usize) -> Self {
        let mut cluster = Self::with_pool(machines).await;
        cluster.controller.init_service(nodes).await.unwrap();
        cluster.controller.start().await.unwrap();
        cluster
    }
}

impl<L: LocalLauncher> TestCluster<L> {
    /// A pool of `machines` local machines driven through `launcher`.
    pub async fn with_config(machines: usize, launcher: L, config: ControllerConfig) -> Self {
        let machines: Vec<ServerIdentity> = allocate_os_ports(machines)
            .await
            .into_iter()
            .enumerate()
            .map(|(i, port)| ServerIdentity::new(format!("server{}", i + 1), "127.0.0.1", port))
            .collect();

        let launcher = Arc::new(launcher);
        let controller = ClusterController::new(
            MachineRepository::new(machines.clone()),
            launcher.clone(),
            config,
        );

        Self {
            controller,
            launcher,
            machines,
        }
    }

    /// Route controller events to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn ClusterEventListener>) -> Self {
        self.controller = self.controller.with_listener(listener);
        self
    }

    /// The node running on `machine`.
    pub fn node(&self, machine: &ServerIdentity) -> Arc<NodeController> {
        self.launcher
            .node(machine)
            .unwrap_or_else(|| panic!("no node running on {}", machine))
    }

    /// Total number of records across all running nodes.
    pub fn total_records(&self) -> usize {
        self.controller
            .nodes()
            .iter()
            .map(|machine| self.node(machine).storage().len())
            .sum()
    }

    /// The node whose storage holds `key`, if exactly one does.
    pub fn holder_of(&self, key: &str) -> Option<ServerIdentity> {
        let holders: Vec<_> = self
            .controller
            .nodes()
            .iter()
            .filter(|machine| self.node(machine).storage().contains(key))
            .cloned()
            .collect();
        match holders.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }
}
