//! Configuration types for storage nodes and the cluster controller.

use crate::network::rpc::MAX_MESSAGE_SIZE;
use crate::types::ServerIdentity;
use std::net::SocketAddr;
use std::time::Duration;

/// Retry and timeout behaviour for outbound connections.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum connection attempts before giving up.
    pub max_attempts: usize,

    /// Delay before the second attempt; doubles on every further attempt.
    pub initial_backoff: Duration,

    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,

    /// Timeout for establishing a TCP connection.
    pub connect_timeout: Duration,

    /// Timeout for a full request/response exchange.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the initial backoff delay.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Configuration for a single storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity announced in cluster metadata.
    pub identity: ServerIdentity,

    /// Address to bind the listener to. Defaults to the identity's endpoint.
    pub bind_addr: Option<SocketAddr>,

    /// Maximum accepted frame size.
    pub max_message_size: usize,

    /// Target payload size of a single migration batch.
    pub transfer_batch_bytes: usize,

    /// Retry policy for peer transfers.
    pub retry: RetryConfig,
}

impl NodeConfig {
    /// Create a configuration for the given identity.
    pub fn new(identity: ServerIdentity) -> Self {
        Self {
            identity,
            bind_addr: None,
            max_message_size: MAX_MESSAGE_SIZE,
            transfer_batch_bytes: MAX_MESSAGE_SIZE / 2,
            retry: RetryConfig::default(),
        }
    }

    /// Bind to an explicit address instead of the identity endpoint.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the migration batch size in bytes.
    pub fn with_transfer_batch_bytes(mut self, bytes: usize) -> Self {
        self.transfer_batch_bytes = bytes.clamp(1, self.max_message_size);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The address the listener binds to.
    pub fn listen_endpoint(&self) -> String {
        match self.bind_addr {
            Some(addr) => addr.to_string(),
            None => self.identity.endpoint(),
        }
    }
}

/// Configuration for the cluster controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Retry policy for control commands.
    pub retry: RetryConfig,

    /// Time a freshly launched node gets before the first INIT attempt.
    pub launch_grace: Duration,

    /// How long the controller waits for a MOVE_DATA reply before asking
    /// the donor how the migration ended.
    pub migration_timeout: Duration,

    /// Timeout for that question. The donor answers only once any
    /// in-flight transfer has finished.
    pub resolve_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            launch_grace: Duration::from_millis(200),
            migration_timeout: Duration::from_secs(300),
            resolve_timeout: Duration::from_secs(600),
        }
    }
}

impl ControllerConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the launch grace period.
    pub fn with_launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    /// Set the MOVE_DATA reply timeout.
    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }

    /// Set the timeout for resolving a migration with a lost reply.
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Retry policy for MOVE_DATA.
    pub(crate) fn transfer_retry(&self) -> RetryConfig {
        self.retry.clone().with_request_timeout(self.migration_timeout)
    }

    /// Retry policy for RESOLVE_MIGRATION.
    pub(crate) fn resolve_retry(&self) -> RetryConfig {
        self.retry.clone().with_request_timeout(self.resolve_timeout)
    }
}
