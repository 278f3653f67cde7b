//! Versioned cluster metadata: the ordered server list every node caches.
//!
//! The canonical text form is `name,address,port;name,address,port`. Parsing
//! is lenient: a malformed entry is logged and skipped, the rest still form
//! valid metadata.

use crate::error::RoutingError;
use crate::partitioning::hashring::{HashRing, KeyRange};
use crate::types::ServerIdentity;
use std::fmt;
use tracing::warn;

const ENTRY_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = ',';

/// The cluster's current server list together with the ring built from it.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    /// Servers in insertion order.
    servers: Vec<ServerIdentity>,

    /// Ring rebuilt from `servers` on every change.
    ring: HashRing,
}

impl ClusterMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from a server list, skipping duplicates and collisions.
    pub fn from_servers(servers: impl IntoIterator<Item = ServerIdentity>) -> Self {
        let mut metadata = Self::new();
        for server in servers {
            if let Err(e) = metadata.add_server(server) {
                warn!(error = %e, "Skipping server while building metadata");
            }
        }
        metadata
    }

    /// Parse the canonical text form.
    pub fn parse(text: &str) -> Self {
        let mut metadata = Self::new();

        for entry in text.split(ENTRY_SEPARATOR) {
            if entry.trim().is_empty() {
                continue;
            }

            let server = match parse_entry(entry) {
                Ok(server) => server,
                Err(reason) => {
                    warn!(entry, reason, "Dropping malformed metadata entry");
                    continue;
                }
            };

            if let Err(e) = metadata.add_server(server) {
                warn!(entry, error = %e, "Dropping conflicting metadata entry");
            }
        }

        metadata
    }

    /// Render the canonical text form.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Servers in insertion order.
    pub fn servers(&self) -> &[ServerIdentity] {
        &self.servers
    }

    /// The ring derived from the server list.
    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Number of servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether there are no servers.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Check if a server is part of the metadata.
    pub fn contains(&self, identity: &ServerIdentity) -> bool {
        self.servers.contains(identity)
    }

    /// Append a server. Duplicates and ring collisions are rejected.
    pub fn add_server(&mut self, identity: ServerIdentity) -> Result<(), RoutingError> {
        if self.contains(&identity) {
            return Err(RoutingError::DuplicateServer(identity.to_string()));
        }

        let mut candidate = self.servers.clone();
        candidate.push(identity);
        self.ring = HashRing::from_servers(&candidate)?;
        self.servers = candidate;
        Ok(())
    }

    /// Remove the server listening on `address:port`.
    pub fn remove_server(&mut self, address: &str, port: u16) -> Option<ServerIdentity> {
        let index = self
            .servers
            .iter()
            .position(|s| s.address == address && s.port == port)?;
        let removed = self.servers.remove(index);
        self.rebuild_ring();
        Some(removed)
    }

    /// Find the server responsible for a key.
    pub fn route(&self, key: &str) -> Result<&ServerIdentity, RoutingError> {
        self.ring.route(key)
    }

    /// Whether `identity` is responsible for `key`.
    pub fn is_responsible(&self, identity: &ServerIdentity, key: &str) -> bool {
        matches!(self.route(key), Ok(owner) if owner == identity)
    }

    /// The ring interval owned by a server.
    pub fn range_of(&self, identity: &ServerIdentity) -> Result<KeyRange, RoutingError> {
        self.ring.range_of(identity)
    }

    /// The successor of a server on the ring.
    pub fn successor(&self, identity: &ServerIdentity) -> Result<&ServerIdentity, RoutingError> {
        self.ring.successor(identity)
    }

    fn rebuild_ring(&mut self) {
        // Removing entries can never introduce a collision.
        self.ring = HashRing::from_servers(&self.servers).unwrap_or_default();
    }
}

fn parse_entry(entry: &str) -> std::result::Result<ServerIdentity, &'static str> {
    let fields: Vec<&str> = entry.split(FIELD_SEPARATOR).map(str::trim).collect();
    if fields.len() != 3 {
        return Err("expected name,address,port");
    }
    if fields[0].is_empty() || fields[1].is_empty() {
        return Err("empty name or address");
    }
    let port: u16 = fields[2].parse().map_err(|_| "port is not a number")?;
    Ok(ServerIdentity::new(fields[0], fields[1], port))
}

impl fmt::Display for ClusterMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", ENTRY_SEPARATOR)?;
            }
            write!(
                f,
                "{}{sep}{}{sep}{}",
                server.name,
                server.address,
                server.port,
                sep = FIELD_SEPARATOR
            )?;
        }
        Ok(())
    }
}

impl PartialEq for ClusterMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.serialize() == other.serialize()
    }
}

impl Eq for ClusterMetadata {}
