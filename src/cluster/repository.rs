//! Pool of machines nodes can be launched on.
//!
//! The repository file lists one machine per line as `name address port`.
//! Blank lines and lines starting with `#` are ignored:
//!
//! ```text
//! # storage pool
//! server1 127.0.0.1 50000
//! server2 127.0.0.1 50001
//! ```

use crate::error::{ClusterError, Error, Result};
use crate::types::ServerIdentity;
use rand::Rng;
use std::path::Path;
use tracing::debug;

/// Idle and in-use machines.
#[derive(Debug, Clone, Default)]
pub struct MachineRepository {
    /// Machines with no node running.
    available: Vec<ServerIdentity>,

    /// Machines hosting a node.
    in_use: Vec<ServerIdentity>,
}

impl MachineRepository {
    /// Create a repository where every machine is idle.
    pub fn new(machines: impl IntoIterator<Item = ServerIdentity>) -> Self {
        let mut repository = Self::default();
        for machine in machines {
            if !repository.available.contains(&machine) {
                repository.available.push(machine);
            }
        }
        repository
    }

    /// Parse the repository text format.
    pub fn parse(text: &str) -> Result<Self> {
        let mut machines: Vec<ServerIdentity> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let invalid = |reason: String| ClusterError::InvalidRepository {
                line: index + 1,
                reason,
            };

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, address, port] = fields.as_slice() else {
                return Err(invalid(format!("expected 3 fields, got {}", fields.len())).into());
            };
            let port: u16 = port
                .parse()
                .map_err(|_| invalid(format!("invalid port {:?}", port)))?;

            let machine = ServerIdentity::new(*name, *address, port);
            if machines.contains(&machine) {
                return Err(invalid(format!("duplicate machine {}", machine.endpoint())).into());
            }
            machines.push(machine);
        }

        debug!(machines = machines.len(), "Parsed machine repository");
        Ok(Self::new(machines))
    }

    /// Load a repository file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Number of idle machines.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Machines hosting a node.
    pub fn in_use(&self) -> &[ServerIdentity] {
        &self.in_use
    }

    /// Total number of machines.
    pub fn len(&self) -> usize {
        self.available.len() + self.in_use.len()
    }

    /// Whether the repository has no machines at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a random idle machine.
    pub fn take_random(&mut self) -> Option<ServerIdentity> {
        if self.available.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.available.len());
        let machine = self.available.swap_remove(index);
        self.in_use.push(machine.clone());
        Some(machine)
    }

    /// Return a machine to the idle pool. Returns whether it was in use.
    pub fn release(&mut self, machine: &ServerIdentity) -> bool {
        match self.in_use.iter().position(|m| m == machine) {
            Some(index) => {
                let machine = self.in_use.swap_remove(index);
                self.available.push(machine);
                true
            }
            None => false,
        }
    }

    /// Return every machine to the idle pool.
    pub fn release_all(&mut self) {
        self.available.append(&mut self.in_use);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POOL: &str = "\
# storage pool
server1 127.0.0.1 50000

server2 127.0.0.1 50001
server3 127.0.0.1 50002
";

    #[test]
    fn test_parse() {
        let repository = MachineRepository::parse(POOL).unwrap();
        assert_eq!(repository.len(), 3);
        assert_eq!(repository.available_count(), 3);
        assert!(repository.in_use().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let err = MachineRepository::parse("server1 127.0.0.1\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Cluster(ClusterError::InvalidRepository { line: 1, .. })
        ));

        let err = MachineRepository::parse("# x\nserver1 127.0.0.1 port\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Cluster(ClusterError::InvalidRepository { line: 2, .. })
        ));

        let err =
            MachineRepository::parse("a 127.0.0.1 5000\nb 127.0.0.1 5000\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Cluster(ClusterError::InvalidRepository { line: 2, .. })
        ));
    }

    #[test]
    fn test_take_and_release() {
        let mut repository = MachineRepository::parse(POOL).unwrap();

        let taken: Vec<_> = (0..3).filter_map(|_| repository.take_random()).collect();
        assert_eq!(taken.len(), 3);
        assert!(repository.take_random().is_none());
        assert_eq!(repository.in_use().len(), 3);

        assert!(repository.release(&taken[0]));
        assert!(!repository.release(&taken[0]));
        assert_eq!(repository.available_count(), 1);

        repository.release_all();
        assert_eq!(repository.available_count(), 3);
        assert_eq!(repository.len(), 3);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(POOL.as_bytes()).unwrap();

        let repository = MachineRepository::from_file(file.path()).unwrap();
        assert_eq!(repository.len(), 3);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            MachineRepository::from_file(missing),
            Err(Error::Config(_))
        ));
    }
}
