//! Consistent hash ring over server identities.
//!
//! Every server occupies exactly one position on a 32-bit ring: the first
//! four bytes (big-endian) of the MD5 digest of its `address:port`. A key is
//! owned by the server at the smallest position greater than or equal to the
//! key's hash, wrapping around to the lowest position.

use crate::error::RoutingError;
use crate::types::ServerIdentity;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hash arbitrary bytes onto the ring.
pub fn hash_key(key: &[u8]) -> u32 {
    let digest = Md5::digest(key);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Ring position of a server.
pub fn server_position(identity: &ServerIdentity) -> u32 {
    hash_key(identity.endpoint().as_bytes())
}

/// A ring interval `(start, end]`.
///
/// Wraps past `u32::MAX` when `start > end`. `start == end` covers the whole
/// ring, which is what a single-node cluster owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Exclusive lower bound.
    pub start: u32,
    /// Inclusive upper bound.
    pub end: u32,
}

impl KeyRange {
    /// Create a new range.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Check whether a ring position falls inside the range.
    pub fn contains(&self, position: u32) -> bool {
        if self.start < self.end {
            position > self.start && position <= self.end
        } else if self.start > self.end {
            position > self.start || position <= self.end
        } else {
            true
        }
    }

    /// Whether the range spans the full ring.
    pub fn is_full_ring(&self) -> bool {
        self.start == self.end
    }
}

/// A consistent hash ring for routing keys to servers.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Ring position to owning server.
    positions: BTreeMap<u32, ServerIdentity>,
}

impl HashRing {
    /// Create a new empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring from a server list in one pass.
    pub fn from_servers<'a, I>(servers: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = &'a ServerIdentity>,
    {
        let mut ring = Self::new();
        for server in servers {
            ring.add_server(server.clone())?;
        }
        Ok(ring)
    }

    /// Number of servers on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the ring has no servers.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Servers in ring order.
    pub fn servers(&self) -> impl Iterator<Item = &ServerIdentity> {
        self.positions.values()
    }

    /// Positions and servers in ring order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &ServerIdentity)> {
        self.positions.iter().map(|(pos, server)| (*pos, server))
    }

    /// Check if a server is on the ring.
    pub fn contains(&self, identity: &ServerIdentity) -> bool {
        self.positions.get(&server_position(identity)) == Some(identity)
    }

    /// Add a server to the ring and return its position.
    ///
    /// Adding a server that is already present is a no-op. A different
    /// server hashing to an occupied position is rejected.
    pub fn add_server(&mut self, identity: ServerIdentity) -> Result<u32, RoutingError> {
        let position = server_position(&identity);
        if let Some(existing) = self.positions.get(&position) {
            if *existing == identity {
                return Ok(position);
            }
            return Err(RoutingError::HashCollision {
                position,
                existing: existing.to_string(),
                incoming: identity.to_string(),
            });
        }
        self.positions.insert(position, identity);
        Ok(position)
    }

    /// Remove a server from the ring. Returns whether it was present.
    pub fn remove(&mut self, identity: &ServerIdentity) -> bool {
        let position = server_position(identity);
        match self.positions.get(&position) {
            Some(existing) if existing == identity => {
                self.positions.remove(&position);
                true
            }
            _ => false,
        }
    }

    /// Find the server responsible for a key.
    pub fn route(&self, key: &str) -> Result<&ServerIdentity, RoutingError> {
        self.owner_of_position(hash_key(key.as_bytes()))
    }

    /// Find the server owning a ring position.
    pub fn owner_of_position(&self, position: u32) -> Result<&ServerIdentity, RoutingError> {
        self.positions
            .range(position..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, server)| server)
            .ok_or(RoutingError::EmptyRing)
    }

    /// The next server clockwise from the given one.
    ///
    /// For a single-server ring this is the server itself.
    pub fn successor(&self, identity: &ServerIdentity) -> Result<&ServerIdentity, RoutingError> {
        let position = self.position_of(identity)?;
        self.positions
            .range(position.wrapping_add(1)..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, server)| server)
            .ok_or(RoutingError::EmptyRing)
    }

    /// The previous server counter-clockwise from the given one.
    pub fn predecessor(
        &self,
        identity: &ServerIdentity,
    ) -> Result<(u32, &ServerIdentity), RoutingError> {
        let position = self.position_of(identity)?;
        self.positions
            .range(..position)
            .next_back()
            .or_else(|| self.positions.iter().next_back())
            .map(|(pos, server)| (*pos, server))
            .ok_or(RoutingError::EmptyRing)
    }

    /// The interval of the ring a server is responsible for.
    pub fn range_of(&self, identity: &ServerIdentity) -> Result<KeyRange, RoutingError> {
        let position = self.position_of(identity)?;
        let (pred, _) = self.predecessor(identity)?;
        Ok(KeyRange::new(pred, position))
    }

    fn position_of(&self, identity: &ServerIdentity) -> Result<u32, RoutingError> {
        let position = server_position(identity);
        match self.positions.get(&position) {
            Some(existing) if existing == identity => Ok(position),
            _ => Err(RoutingError::UnknownServer(identity.to_string())),
        }
    }
}
