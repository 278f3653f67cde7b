//! Core types used throughout the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier handed out by the controller for each migration step.
pub type MigrationId = u64;

/// A storage server: a human-readable name plus the address it listens on.
///
/// Two identities are the same server when address and port match; the name
/// is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Human-readable server name.
    pub name: String,
    /// Host name or IP address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl ServerIdentity {
    /// Create a new identity.
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// The `address:port` string used both for connecting and for hashing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

/// Lifecycle state of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Rejects all client requests.
    Stopped,
    /// Accepts reads and writes.
    Serving,
    /// Accepts reads, rejects writes.
    WriteLocked,
}

impl NodeState {
    /// Whether client writes are currently frozen.
    pub fn writes_frozen(self) -> bool {
        !matches!(self, NodeState::Serving)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "STOPPED"),
            NodeState::Serving => write!(f, "SERVING"),
            NodeState::WriteLocked => write!(f, "WRITE_LOCKED"),
        }
    }
}
