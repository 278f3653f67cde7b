//! Storage node runtime.
//!
//! A running node consists of:
//!
//! - a [`NetworkServer`] accept loop with one task per connection, serving
//!   client and peer requests directly;
//! - a single control task that applies controller commands strictly in
//!   order, fed through an mpsc queue and replying over oneshot channels;
//! - a `watch` channel that flips on SHUTDOWN and closes every socket.

pub mod controller;

pub use controller::NodeController;

use crate::config::NodeConfig;
use crate::error::{Result, StateError};
use crate::network::rpc::{ControlRequest, ControlResponse, Message};
use crate::network::server::{MessageHandler, NetworkServer};
use crate::types::ServerIdentity;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Queued control commands per node.
const CONTROL_QUEUE_DEPTH: usize = 64;

/// A control command waiting for the control task.
struct ControlCommand {
    request: ControlRequest,
    reply: oneshot::Sender<ControlResponse>,
}

/// Entry point for starting a node.
pub struct KvNode;

impl KvNode {
    /// Bind the listener and start the node's tasks.
    ///
    /// The node starts Stopped with empty metadata and waits for INIT.
    pub async fn start(config: NodeConfig) -> Result<KvNodeHandle> {
        let controller = Arc::new(NodeController::new(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);

        let handler = NodeMessageHandler {
            controller: controller.clone(),
            control_tx,
        };

        let server = NetworkServer::bind(
            &config.listen_endpoint(),
            Arc::new(handler),
            config.max_message_size,
            shutdown_rx.clone(),
        )
        .await?;
        let local_addr = server.local_addr();

        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Network server error");
            }
        });

        let control_task = tokio::spawn(run_control_loop(
            controller.clone(),
            control_rx,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        info!(node = %config.identity, addr = %local_addr, "Node started");

        Ok(KvNodeHandle {
            controller,
            local_addr,
            shutdown_tx,
            server_task,
            control_task,
        })
    }
}

/// Handle to a running node.
pub struct KvNodeHandle {
    controller: Arc<NodeController>,
    local_addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    server_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
}

impl KvNodeHandle {
    /// The node's identity.
    pub fn identity(&self) -> &ServerIdentity {
        self.controller.identity()
    }

    /// The address the node listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node's controller, for inspection.
    pub fn controller(&self) -> &Arc<NodeController> {
        &self.controller
    }

    /// Whether the node has stopped accepting connections.
    pub fn is_finished(&self) -> bool {
        self.server_task.is_finished()
    }

    /// Resolve once the node begins shutting down.
    pub async fn terminated(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Stop the node without waiting for a SHUTDOWN command.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until the node has shut down and all its sockets are closed.
    pub async fn wait(self) {
        let _ = self.server_task.await;
        let _ = self.control_task.await;
    }
}

impl std::fmt::Debug for KvNodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvNodeHandle")
            .field("identity", self.identity())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn run_control_loop(
    controller: Arc<NodeController>,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            command = control_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let response = controller.handle_control(command.request).await;
        let _ = command.reply.send(response);

        if controller.is_terminated() {
            shutdown_tx.send_replace(true);
            break;
        }
    }
}

/// Routes decoded messages: control to the control task, the rest inline.
struct NodeMessageHandler {
    controller: Arc<NodeController>,
    control_tx: mpsc::Sender<ControlCommand>,
}

#[async_trait]
impl MessageHandler for NodeMessageHandler {
    async fn handle(&self, msg: Message) -> Message {
        match msg {
            Message::Control(request) => {
                let (reply, rx) = oneshot::channel();
                if self
                    .control_tx
                    .send(ControlCommand { request, reply })
                    .await
                    .is_err()
                {
                    return Message::ControlReply(terminated());
                }
                Message::ControlReply(rx.await.unwrap_or_else(|_| terminated()))
            }
            Message::Peer(request) => Message::PeerReply(self.controller.handle_peer(request)),
            Message::Client(request) => {
                Message::ClientReply(self.controller.handle_client(request))
            }
            other => Message::Failed(format!("not a request: {:?}", other)),
        }
    }
}

fn terminated() -> ControlResponse {
    ControlResponse::failed(StateError::Terminated.to_string())
}
