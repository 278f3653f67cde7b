//! Cluster control plane.
//!
//! The [`ClusterController`] owns the machine pool, the authoritative
//! metadata and the launcher, and talks to nodes only through control
//! commands.

pub mod controller;
pub mod events;
pub mod launcher;
pub mod repository;

pub use controller::ClusterController;
pub use events::{ClusterEvent, ClusterEventListener, LoggingEventListener, NoopEventListener};
pub use launcher::{InProcessLauncher, NodeLauncher, ProcessLauncher};
pub use repository::MachineRepository;
