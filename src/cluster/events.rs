//! Cluster topology events.

use crate::types::{MigrationId, ServerIdentity};

/// Events emitted by the cluster controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    /// A node was launched and initialized.
    NodeLaunched {
        /// The node.
        node: ServerIdentity,
    },

    /// A node joined the ring and received its range.
    NodeJoined {
        /// The node.
        node: ServerIdentity,
        /// The migration that populated it, if any.
        migration_id: Option<MigrationId>,
    },

    /// A node left the ring and handed its range to its successor.
    NodeRemoved {
        /// The node.
        node: ServerIdentity,
        /// The migration that drained it.
        migration_id: MigrationId,
    },

    /// A range migration finished.
    MigrationCompleted {
        /// The migration.
        migration_id: MigrationId,
        /// Node that gave up the range.
        donor: ServerIdentity,
        /// Node that received the range.
        destination: ServerIdentity,
        /// Records moved.
        transferred: usize,
    },

    /// A node could not be reached or rejected a command.
    NodeDegraded {
        /// The node.
        node: ServerIdentity,
        /// The command that failed.
        command: &'static str,
        /// Why it failed.
        reason: String,
    },

    /// New metadata was broadcast.
    MetadataUpdated {
        /// Canonical metadata text.
        metadata: String,
    },
}

impl ClusterEvent {
    /// Get the node associated with this event, if any.
    pub fn node(&self) -> Option<&ServerIdentity> {
        match self {
            ClusterEvent::NodeLaunched { node }
            | ClusterEvent::NodeJoined { node, .. }
            | ClusterEvent::NodeRemoved { node, .. }
            | ClusterEvent::NodeDegraded { node, .. } => Some(node),
            ClusterEvent::MigrationCompleted { destination, .. } => Some(destination),
            ClusterEvent::MetadataUpdated { .. } => None,
        }
    }

    /// Check if this event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, ClusterEvent::NodeDegraded { .. })
    }
}

/// Listener for cluster events.
pub trait ClusterEventListener: Send + Sync + 'static {
    /// Called when a cluster event occurs.
    fn on_event(&self, event: ClusterEvent);
}

/// No-op event listener.
pub struct NoopEventListener;

impl ClusterEventListener for NoopEventListener {
    fn on_event(&self, _event: ClusterEvent) {}
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl ClusterEventListener for LoggingEventListener {
    fn on_event(&self, event: ClusterEvent) {
        match &event {
            ClusterEvent::NodeLaunched { node } => {
                tracing::info!(%node, "Node launched");
            }
            ClusterEvent::NodeJoined { node, migration_id } => {
                tracing::info!(%node, ?migration_id, "Node joined ring");
            }
            ClusterEvent::NodeRemoved { node, migration_id } => {
                tracing::info!(%node, migration_id, "Node removed from ring");
            }
            ClusterEvent::MigrationCompleted {
                migration_id,
                donor,
                destination,
                transferred,
            } => {
                tracing::info!(
                    migration_id,
                    %donor,
                    %destination,
                    transferred,
                    "Migration completed"
                );
            }
            ClusterEvent::NodeDegraded {
                node,
                command,
                reason,
            } => {
                tracing::warn!(%node, command, %reason, "Node degraded");
            }
            ClusterEvent::MetadataUpdated { metadata } => {
                tracing::debug!(%metadata, "Metadata updated");
            }
        }
    }
}
