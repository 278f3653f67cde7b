//! Outbound request/response calls with bounded retry.

use crate::config::RetryConfig;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::network::rpc::{
    decode_message, frame_message, read_frame, ClientRequest, ClientResponse, ControlRequest,
    ControlResponse, Frame, Message, PeerRequest, PeerResponse, MAX_MESSAGE_SIZE,
};
use crate::types::ServerIdentity;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

/// Sends one request per connection and waits for the reply.
///
/// Transient failures (refused connection, timeout, reset) are retried with
/// exponential backoff up to `RetryConfig::max_attempts`; anything else is
/// returned immediately. An [`at_most_once`](Self::at_most_once) client
/// only retries when the connection could not be established, so a request
/// that may have reached the node is never sent twice.
#[derive(Debug, Clone)]
pub struct RpcClient {
    retry: RetryConfig,
    max_message_size: usize,
    at_most_once: bool,
}

impl RpcClient {
    /// Create a client with the given retry policy.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            max_message_size: MAX_MESSAGE_SIZE,
            at_most_once: false,
        }
    }

    /// Retry only requests that were never delivered.
    pub fn at_most_once(mut self) -> Self {
        self.at_most_once = true;
        self
    }

    /// Override the frame size limit.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// The retry policy in use.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Send a control command and wait for its reply.
    pub async fn send_control(
        &self,
        target: &ServerIdentity,
        request: ControlRequest,
    ) -> Result<ControlResponse> {
        match self.call(target, &Message::Control(request)).await? {
            Message::ControlReply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    /// Send a peer transfer message and wait for its reply.
    pub async fn send_peer(
        &self,
        target: &ServerIdentity,
        request: PeerRequest,
    ) -> Result<PeerResponse> {
        match self.call(target, &Message::Peer(request)).await? {
            Message::PeerReply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    /// Send a client request and wait for its reply.
    pub async fn send_client(
        &self,
        target: &ServerIdentity,
        request: ClientRequest,
    ) -> Result<ClientResponse> {
        match self.call(target, &Message::Client(request)).await? {
            Message::ClientReply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    /// Send any message, retrying transient failures.
    pub async fn call(&self, target: &ServerIdentity, msg: &Message) -> Result<Message> {
        let addr = target.endpoint();
        let framed = frame_message(msg, self.max_message_size)?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            trace!(%addr, attempt = attempts, "Sending request");

            match self.call_once(target, &framed).await {
                Ok(reply) => return Ok(reply),
                Err(e) if self.at_most_once && !is_undelivered(&e) => return Err(e),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let delay = self.retry.backoff_for(attempts);
                    warn!(
                        %addr,
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(NetworkError::RetriesExhausted {
                        addr,
                        attempts,
                        last_error: e.to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, target: &ServerIdentity, framed: &[u8]) -> Result<Message> {
        let addr = target.endpoint();
        match timeout(self.retry.request_timeout, self.exchange(target, framed)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(addr).into()),
        }
    }

    async fn exchange(&self, target: &ServerIdentity, framed: &[u8]) -> Result<Message> {
        let mut stream = self.connect(target).await?;
        stream.write_all(framed).await?;
        stream.flush().await?;

        match read_frame(&mut stream, self.max_message_size).await? {
            None => Err(NetworkError::ConnectionClosed.into()),
            Some(Frame::Oversized(size)) => Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            }
            .into()),
            Some(Frame::Payload(data)) => match decode_message(&data)? {
                Message::Failed(reason) => Err(ProtocolError::Failed(reason).into()),
                reply => Ok(reply),
            },
        }
    }

    async fn connect(&self, target: &ServerIdentity) -> Result<TcpStream> {
        let addr = target.endpoint();
        let connect = TcpStream::connect((target.address.as_str(), target.port));

        match timeout(self.retry.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(%addr, "Connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(NetworkError::ConnectionFailed {
                addr,
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(NetworkError::Timeout(addr).into()),
        }
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn is_undelivered(e: &Error) -> bool {
    matches!(e, Error::Network(NetworkError::ConnectionFailed { .. }))
}

fn unexpected(msg: Message) -> Error {
    ProtocolError::UnexpectedReply(format!("{:?}", msg)).into()
}
