//! Error types for the partitioned store.

use crate::rebalancing::RebalanceError;
use crate::types::NodeState;
use std::io;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the partitioned store.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Ring routing errors.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Transport errors on the control, peer or client channel.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Command not valid in the node's current lifecycle state.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Data migration errors.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Cluster controller errors.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Rebalancing bookkeeping errors.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),
}

/// Malformed or unexpected messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The command keyword is not known.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The command carried the wrong number of arguments.
    #[error("{command} expects {expected} arguments, got {actual}")]
    WrongArgumentCount {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The frame exceeds the maximum message size.
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The peer answered FAILED.
    #[error("remote reported failure: {0}")]
    Failed(String),
}

/// Errors resolving a key or server on the ring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No servers are registered.
    #[error("hash ring is empty")]
    EmptyRing,

    /// The referenced server is not part of the ring.
    #[error("server not on ring: {0}")]
    UnknownServer(String),

    /// Two distinct servers hash to the same ring position.
    #[error("ring position {position:#010x} already held by {existing}, cannot add {incoming}")]
    HashCollision {
        position: u32,
        existing: String,
        incoming: String,
    },

    /// The server is already registered.
    #[error("server already on ring: {0}")]
    DuplicateServer(String),
}

/// Transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed by the remote end.
    #[error("connection closed")]
    ConnectionClosed,

    /// A request did not complete in time.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// Every retry attempt failed.
    #[error("gave up on {addr} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        addr: String,
        attempts: usize,
        last_error: String,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle state violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// MOVE_DATA requires the node to reject writes first.
    #[error("node must be write locked, current state is {0}")]
    NotWriteLocked(NodeState),

    /// The node has been shut down.
    #[error("node has been shut down")]
    Terminated,
}

/// Data migration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// A batch could not be delivered or applied.
    #[error("migration {migration_id} failed: {reason}")]
    TransferFailed { migration_id: u64, reason: String },

    /// The destination acknowledged a different migration or batch.
    #[error("migration {migration_id}: bad acknowledgement for batch {sequence}")]
    BadAcknowledgement { migration_id: u64, sequence: u32 },

    /// A single record exceeds the maximum message size.
    #[error("record {key} too large to transfer ({size} bytes)")]
    RecordTooLarge { key: String, size: usize },

    /// The migration was fenced by a resolve query and must not run.
    #[error("migration {0} was fenced")]
    Fenced(u64),

    /// The donor could not be asked how the migration ended.
    #[error("outcome of migration {migration_id} unknown: {reason}")]
    OutcomeUnknown { migration_id: u64, reason: String },
}

/// Cluster controller errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The service has not been initialized.
    #[error("service not initialized")]
    NotInitialized,

    /// The service is already running nodes.
    #[error("service already initialized")]
    AlreadyInitialized,

    /// The repository has no idle machine.
    #[error("no machine available in repository")]
    NoMachineAvailable,

    /// Removing the node would leave the cluster empty.
    #[error("cannot remove the last node")]
    LastNode,

    /// The node is not part of the cluster.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// Fewer nodes than requested could be launched.
    #[error("requested {requested} nodes, only {launched} could be launched")]
    InsufficientNodes { requested: usize, launched: usize },

    /// The launcher could not start a node.
    #[error("failed to launch {node}: {reason}")]
    LaunchFailed { node: String, reason: String },

    /// The machine repository could not be parsed.
    #[error("invalid repository line {line}: {reason}")]
    InvalidRepository { line: usize, reason: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Protocol(ProtocolError::Malformed(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl Error {
    /// Whether a retry could succeed (connect refused, timeout, reset).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(
                NetworkError::ConnectionFailed { .. }
                    | NetworkError::Timeout(_)
                    | NetworkError::ConnectionClosed
                    | NetworkError::Io(_)
            )
        )
    }

    /// Whether a migration may or may not have been applied.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Error::Migration(MigrationError::OutcomeUnknown { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err: Error = NetworkError::Timeout("127.0.0.1:1".to_string()).into();
        assert!(err.is_transient());

        let err: Error = StateError::Terminated.into();
        assert!(!err.is_transient());

        let err: Error = ProtocolError::Malformed("x".to_string()).into();
        assert!(!err.is_transient());

        let err: Error = MigrationError::OutcomeUnknown {
            migration_id: 4,
            reason: "timed out".to_string(),
        }
        .into();
        assert!(err.is_outcome_unknown());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::WrongArgumentCount {
            command: "MOVE_DATA",
            expected: 7,
            actual: 2,
        };
        assert_eq!(err.to_string(), "MOVE_DATA expects 7 arguments, got 2");

        let err = StateError::NotWriteLocked(NodeState::Serving);
        assert_eq!(
            err.to_string(),
            "node must be write locked, current state is SERVING"
        );
    }
}
