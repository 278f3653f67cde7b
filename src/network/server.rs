//! TCP server for control, peer and client messages.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, read_frame, write_message, Frame, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long open connections get to flush their last reply on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and return the reply.
    async fn handle(&self, msg: Message) -> Message;
}

/// TCP server; one task per accepted connection.
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// Address actually bound (resolves port 0).
    local_addr: SocketAddr,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Frame size limit.
    max_message_size: usize,

    /// Flips to `true` when the node shuts down.
    shutdown_rx: watch::Receiver<bool>,
}

impl NetworkServer {
    /// Bind the listener.
    pub async fn bind(
        bind_addr: &str,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;

        Ok(Self {
            listener,
            local_addr,
            handler,
            max_message_size,
            shutdown_rx,
        })
    }

    /// The address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown.
    ///
    /// Returns once the listener is closed and every connection task has
    /// exited.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "Network server listening");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let shutdown_rx = self.shutdown_rx.clone();
                            let max = self.max_message_size;
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, handler, max, shutdown_rx).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(addr = %self.local_addr, "Network server shutting down");
                        break;
                    }
                }
            }
        }

        drop(self.listener);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting connections that did not close in time");
            connections.shutdown().await;
        }

        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
    max_message_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let frame = tokio::select! {
            frame = read_frame(&mut stream, max_message_size) => frame?,
            _ = shutdown_rx.changed() => return Ok(()),
        };

        let reply = match frame {
            None => return Ok(()),
            Some(Frame::Oversized(size)) => {
                warn!(size, max = max_message_size, "Rejecting oversized message");
                Message::Failed(format!(
                    "message of {} bytes exceeds limit of {} bytes",
                    size, max_message_size
                ))
            }
            Some(Frame::Payload(data)) => match decode_message(&data) {
                Ok(msg) => handler.handle(msg).await,
                Err(e) => {
                    warn!(error = %e, "Rejecting malformed message");
                    Message::Failed(format!("malformed message: {}", e))
                }
            },
        };

        write_message(&mut stream, &reply, max_message_size).await?;
    }
}
