//! Rebalancing coordinator for managing data transfer operations.
//!
//! The coordinator plans the single range migration each membership change
//! requires and tracks the operation from planning through commit. It never
//! talks to nodes itself; the cluster controller drives the plan.

use crate::error::{ClusterError, Result};
use crate::network::rpc::MoveDataRequest;
use crate::partitioning::{ClusterMetadata, KeyRange};
use crate::types::{MigrationId, ServerIdentity};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// State of a rebalancing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    /// Planned but no data has moved yet.
    Pending,
    /// Donor is streaming the range.
    Streaming,
    /// Transfer acknowledged, new metadata not yet published.
    Committing,
    /// Rebalancing completed successfully.
    Complete,
    /// Rebalancing failed.
    Failed,
    /// Rebalancing was cancelled.
    Cancelled,
}

/// Type of rebalancing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceType {
    /// Server is joining the ring.
    NodeJoin(ServerIdentity),
    /// Server is leaving the ring.
    NodeLeave(ServerIdentity),
}

/// The one range move a membership change needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Identifier the destination echoes in its acknowledgements.
    pub migration_id: MigrationId,
    /// Node currently holding the range.
    pub donor: ServerIdentity,
    /// Node that will own the range.
    pub destination: ServerIdentity,
    /// Ring interval to move.
    pub range: KeyRange,
}

impl MigrationPlan {
    /// The MOVE_DATA payload sent to the donor, carrying the metadata that
    /// takes effect once the range has moved.
    pub fn to_request(&self, new_metadata: &ClusterMetadata) -> MoveDataRequest {
        MoveDataRequest {
            migration_id: self.migration_id,
            range: self.range,
            destination: self.destination.clone(),
            metadata: new_metadata.serialize(),
        }
    }
}

/// A rebalancing operation.
#[derive(Debug, Clone)]
pub struct RebalanceOperation {
    /// Unique operation ID, also used as the migration ID.
    pub id: u64,

    /// Type of rebalancing.
    pub operation_type: RebalanceType,

    /// Current state.
    pub state: RebalanceState,

    /// When the operation started.
    pub started_at: Instant,

    /// When the operation completed (if complete).
    pub completed_at: Option<Instant>,

    /// Range move, absent when the ring was empty before a join.
    pub plan: Option<MigrationPlan>,

    /// Records the donor reported as transferred.
    pub transferred: usize,

    /// Error message if failed.
    pub error: Option<String>,

    /// Metadata before rebalancing.
    pub old_metadata: ClusterMetadata,

    /// Metadata after rebalancing.
    pub new_metadata: ClusterMetadata,
}

impl RebalanceOperation {
    /// Get the duration of the operation so far.
    pub fn duration(&self) -> Duration {
        self.completed_at
            .map(|t| t.duration_since(self.started_at))
            .unwrap_or_else(|| self.started_at.elapsed())
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            RebalanceState::Complete | RebalanceState::Failed | RebalanceState::Cancelled
        )
    }
}

/// Summary info about a rebalancing operation.
#[derive(Debug, Clone)]
pub struct RebalanceOperationInfo {
    /// Operation ID.
    pub id: u64,
    /// Type of operation.
    pub operation_type: RebalanceType,
    /// Current state.
    pub state: RebalanceState,
    /// Duration so far.
    pub duration: Duration,
    /// Records transferred so far.
    pub transferred: usize,
}

/// Errors that can occur during rebalancing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RebalanceError {
    #[error("rebalancing already in progress")]
    AlreadyInProgress,

    #[error("no active rebalancing operation")]
    NoActiveOperation,

    #[error("invalid state for this operation: {0:?}")]
    InvalidState(RebalanceState),

    #[error("operation already complete")]
    AlreadyComplete,

    #[error("operation not complete")]
    NotComplete,

    #[error("migration {actual} does not belong to operation {expected}")]
    MigrationMismatch { expected: u64, actual: u64 },
}

/// Plans and tracks membership changes, one at a time.
pub struct RebalanceCoordinator {
    /// Next operation ID.
    next_id: AtomicU64,

    /// Current active operation (if any).
    active_operation: RwLock<Option<RebalanceOperation>>,

    /// History of finished operations.
    history: RwLock<Vec<RebalanceOperation>>,

    /// Maximum history size.
    max_history: usize,
}

impl Default for RebalanceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RebalanceCoordinator {
    /// Create a new rebalancing coordinator.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active_operation: RwLock::new(None),
            history: RwLock::new(Vec::new()),
            max_history: 100,
        }
    }

    /// Check if a rebalancing operation is in progress.
    pub fn is_rebalancing(&self) -> bool {
        self.active_operation.read().is_some()
    }

    /// Get the current operation state.
    pub fn current_state(&self) -> Option<RebalanceState> {
        self.active_operation.read().as_ref().map(|op| op.state)
    }

    /// Plan the migration for a server joining the ring.
    ///
    /// The new server takes over `(predecessor, new]` from its successor.
    /// Joining an empty ring needs no migration.
    pub fn start_node_join(
        &self,
        current: &ClusterMetadata,
        joining: ServerIdentity,
    ) -> Result<RebalanceOperation> {
        let mut new_metadata = current.clone();
        new_metadata.add_server(joining.clone())?;

        let route = if current.is_empty() {
            None
        } else {
            let donor = new_metadata.successor(&joining)?.clone();
            let range = new_metadata.range_of(&joining)?;
            Some((donor, joining.clone(), range))
        };

        self.start_operation(
            current,
            new_metadata,
            RebalanceType::NodeJoin(joining),
            route,
        )
    }

    /// Plan the migration for a server leaving the ring.
    ///
    /// The departing server hands its whole range to its successor. The last
    /// server cannot leave.
    pub fn start_node_leave(
        &self,
        current: &ClusterMetadata,
        leaving: &ServerIdentity,
    ) -> Result<RebalanceOperation> {
        if !current.contains(leaving) {
            return Err(ClusterError::UnknownNode(leaving.to_string()).into());
        }
        if current.len() == 1 {
            return Err(ClusterError::LastNode.into());
        }

        let mut new_metadata = current.clone();
        new_metadata.remove_server(&leaving.address, leaving.port);

        let destination = current.successor(leaving)?.clone();
        let range = current.range_of(leaving)?;

        self.start_operation(
            current,
            new_metadata,
            RebalanceType::NodeLeave(leaving.clone()),
            Some((leaving.clone(), destination, range)),
        )
    }

    fn start_operation(
        &self,
        current: &ClusterMetadata,
        new_metadata: ClusterMetadata,
        operation_type: RebalanceType,
        route: Option<(ServerIdentity, ServerIdentity, KeyRange)>,
    ) -> Result<RebalanceOperation> {
        let mut active = self.active_operation.write();

        if active.is_some() {
            return Err(RebalanceError::AlreadyInProgress.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let plan = route.map(|(donor, destination, range)| MigrationPlan {
            migration_id: id,
            donor,
            destination,
            range,
        });

        let operation = RebalanceOperation {
            id,
            operation_type,
            state: RebalanceState::Pending,
            started_at: Instant::now(),
            completed_at: None,
            plan,
            transferred: 0,
            error: None,
            old_metadata: current.clone(),
            new_metadata,
        };

        info!(
            id,
            operation = ?operation.operation_type,
            plan = ?operation.plan,
            "Starting rebalancing operation"
        );

        *active = Some(operation.clone());
        Ok(operation)
    }

    /// Mark the migration as streaming.
    pub fn begin_streaming(&self) -> std::result::Result<(), RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.state != RebalanceState::Pending {
            return Err(RebalanceError::InvalidState(operation.state));
        }

        operation.state = RebalanceState::Streaming;
        debug!(operation_id = operation.id, "Migration streaming");
        Ok(())
    }

    /// Record the donor's completion report.
    pub fn complete_transfer(
        &self,
        migration_id: MigrationId,
        transferred: usize,
    ) -> std::result::Result<(), RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.id != migration_id {
            return Err(RebalanceError::MigrationMismatch {
                expected: operation.id,
                actual: migration_id,
            });
        }
        if operation.state != RebalanceState::Streaming {
            return Err(RebalanceError::InvalidState(operation.state));
        }

        operation.transferred = transferred;
        operation.state = RebalanceState::Committing;

        info!(
            operation_id = operation.id,
            transferred, "Transfer complete"
        );
        Ok(())
    }

    /// Skip straight to committing when there is nothing to move.
    pub fn skip_transfer(&self) -> std::result::Result<(), RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.state != RebalanceState::Pending || operation.plan.is_some() {
            return Err(RebalanceError::InvalidState(operation.state));
        }

        operation.state = RebalanceState::Committing;
        Ok(())
    }

    /// Mark the operation as failed.
    pub fn fail(&self, error: impl Into<String>) -> std::result::Result<(), RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.is_finished() {
            return Err(RebalanceError::AlreadyComplete);
        }

        let error_str = error.into();
        error!(
            operation_id = operation.id,
            error = %error_str,
            "Rebalancing failed"
        );

        operation.state = RebalanceState::Failed;
        operation.error = Some(error_str);
        operation.completed_at = Some(Instant::now());
        Ok(())
    }

    /// Commit and return the metadata to publish.
    pub fn commit(&self) -> std::result::Result<ClusterMetadata, RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.state != RebalanceState::Committing {
            return Err(RebalanceError::InvalidState(operation.state));
        }

        operation.state = RebalanceState::Complete;
        operation.completed_at = Some(Instant::now());

        info!(
            operation_id = operation.id,
            duration_ms = operation.duration().as_millis() as u64,
            "Rebalancing complete"
        );

        Ok(operation.new_metadata.clone())
    }

    /// Cancel the current operation.
    pub fn cancel(&self) -> std::result::Result<(), RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.as_mut().ok_or(RebalanceError::NoActiveOperation)?;

        if operation.is_finished() {
            return Err(RebalanceError::AlreadyComplete);
        }

        operation.state = RebalanceState::Cancelled;
        operation.completed_at = Some(Instant::now());

        warn!(operation_id = operation.id, "Rebalancing cancelled");
        Ok(())
    }

    /// Finish the current operation and move it to history.
    pub fn finish(&self) -> std::result::Result<RebalanceOperation, RebalanceError> {
        let mut active = self.active_operation.write();
        let operation = active.take().ok_or(RebalanceError::NoActiveOperation)?;

        if !operation.is_finished() {
            *active = Some(operation);
            return Err(RebalanceError::NotComplete);
        }

        let mut history = self.history.write();
        history.push(operation.clone());
        while history.len() > self.max_history {
            history.remove(0);
        }

        Ok(operation)
    }

    /// Get the history of finished operations.
    pub fn history(&self) -> Vec<RebalanceOperation> {
        self.history.read().clone()
    }

    /// Get info about the current operation.
    pub fn current_operation_info(&self) -> Option<RebalanceOperationInfo> {
        self.active_operation
            .read()
            .as_ref()
            .map(|op| RebalanceOperationInfo {
                id: op.id,
                operation_type: op.operation_type.clone(),
                state: op.state,
                duration: op.duration(),
                transferred: op.transferred,
            })
    }
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("is_rebalancing", &self.is_rebalancing())
            .field("current_state", &self.current_state())
            .finish()
    }
}
