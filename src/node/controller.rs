//! Per-node lifecycle state machine and request gating.

use crate::config::NodeConfig;
use crate::error::{MigrationError, Result, StateError};
use crate::network::client::RpcClient;
use crate::network::rpc::{
    ClientRequest, ClientResponse, ControlRequest, ControlResponse, MoveDataRequest, PeerRequest,
    PeerResponse,
};
use crate::partitioning::{hash_key, ClusterMetadata, KeyRange};
use crate::rebalancing::{apply_batch, revert_keys, MigrationOutcome, RangeTransfer};
use crate::storage::{StorageEngine, DELETE_SENTINEL};
use crate::types::{MigrationId, NodeState, ServerIdentity};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// A range this node has handed over but whose new owner the cached
/// metadata does not show yet.
#[derive(Debug, Clone)]
struct Handoff {
    range: KeyRange,
    metadata: String,
}

/// Lifecycle, cached metadata and storage of one node.
///
/// Control commands must be applied one at a time (the node runtime feeds
/// them from a single task). Client and peer requests may arrive from any
/// number of connection tasks concurrently.
pub struct NodeController {
    /// This node's identity.
    identity: ServerIdentity,

    /// Current lifecycle state.
    state: RwLock<NodeState>,

    /// Cached cluster metadata; may lag behind the controller's copy.
    metadata: RwLock<ClusterMetadata>,

    /// Local records.
    storage: StorageEngine,

    /// Outbound channel for migrations.
    rpc: RpcClient,

    /// Target migration batch size.
    transfer_batch_bytes: usize,

    /// Frame size limit.
    max_message_size: usize,

    /// Set once SHUTDOWN has been applied.
    terminated: AtomicBool,

    /// How each migration this node donated ended.
    migrations: Mutex<HashMap<MigrationId, MigrationOutcome>>,

    /// Last committed migration, until the next INIT or UPDATE.
    handoff: RwLock<Option<Handoff>>,
}

impl NodeController {
    /// Create a stopped node with empty metadata.
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            state: RwLock::new(NodeState::Stopped),
            metadata: RwLock::new(ClusterMetadata::new()),
            storage: StorageEngine::new(),
            rpc: RpcClient::new(config.retry.clone())
                .with_max_message_size(config.max_message_size),
            transfer_batch_bytes: config.transfer_batch_bytes,
            max_message_size: config.max_message_size,
            terminated: AtomicBool::new(false),
            migrations: Mutex::new(HashMap::new()),
            handoff: RwLock::new(None),
        }
    }

    /// This node's identity.
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Snapshot of the cached metadata.
    pub fn metadata(&self) -> ClusterMetadata {
        self.metadata.read().clone()
    }

    /// Local storage.
    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    /// Whether SHUTDOWN has been applied.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Apply a control command and build its reply.
    pub async fn handle_control(&self, request: ControlRequest) -> ControlResponse {
        let command = request.name();
        match self.apply_control(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(node = %self.identity, command, error = %e, "Control command rejected");
                ControlResponse::failed(e.to_string())
            }
        }
    }

    /// Apply a control command.
    ///
    /// Every transition is idempotent. A rejected command leaves the node
    /// unchanged.
    pub async fn apply_control(&self, request: ControlRequest) -> Result<ControlResponse> {
        if self.is_terminated() {
            return Err(StateError::Terminated.into());
        }

        debug!(node = %self.identity, command = request.name(), "Applying control command");

        match request {
            ControlRequest::Init { metadata } | ControlRequest::Update { metadata } => {
                let parsed = ClusterMetadata::parse(&metadata);
                info!(node = %self.identity, servers = parsed.len(), "Installed metadata");
                *self.metadata.write() = parsed;
                *self.handoff.write() = None;
            }
            ControlRequest::Start => self.transition(|_| NodeState::Serving),
            ControlRequest::Stop => self.transition(|_| NodeState::Stopped),
            ControlRequest::LockWrite => self.transition(|state| match state {
                NodeState::Serving => NodeState::WriteLocked,
                other => other,
            }),
            ControlRequest::UnlockWrite => self.transition(|state| match state {
                NodeState::WriteLocked => NodeState::Serving,
                other => other,
            }),
            ControlRequest::MoveData(move_data) => return self.move_data(&move_data).await,
            ControlRequest::ResolveMigration { migration_id } => {
                return Ok(self.resolve_migration(migration_id));
            }
            ControlRequest::Shutdown => {
                *self.state.write() = NodeState::Stopped;
                self.terminated.store(true, Ordering::SeqCst);
                info!(node = %self.identity, "Node shutting down");
            }
        }

        Ok(ControlResponse::Success)
    }

    fn transition(&self, next: impl FnOnce(NodeState) -> NodeState) {
        let mut state = self.state.write();
        let from = *state;
        *state = next(from);
        if from != *state {
            info!(node = %self.identity, %from, to = %*state, "State changed");
        }
    }

    /// Push a range to another node.
    ///
    /// Writes must be frozen first, which holds while the node is write
    /// locked and also while it is stopped. Each migration id runs at most
    /// once: repeating a committed one replays its reply, and a fenced one
    /// is refused.
    async fn move_data(&self, request: &MoveDataRequest) -> Result<ControlResponse> {
        let migration_id = request.migration_id;
        let recorded = self.migrations.lock().get(&migration_id).cloned();
        match recorded {
            Some(MigrationOutcome::Committed { transferred }) => {
                debug!(node = %self.identity, migration_id, "Replaying committed migration");
                return Ok(ControlResponse::MoveDataComplete {
                    migration_id,
                    transferred,
                });
            }
            Some(MigrationOutcome::Fenced) => {
                return Err(MigrationError::Fenced(migration_id).into());
            }
            Some(MigrationOutcome::Failed { .. }) | None => {}
        }

        let state = self.state();
        if !state.writes_frozen() {
            return Err(StateError::NotWriteLocked(state).into());
        }

        let transfer = RangeTransfer::new(
            &self.storage,
            &self.rpc,
            self.transfer_batch_bytes,
            self.max_message_size,
        );
        let handoff = Handoff {
            range: request.range,
            metadata: request.metadata.clone(),
        };
        let result = transfer
            .push(request, || *self.handoff.write() = Some(handoff))
            .await;

        let outcome = match &result {
            Ok(report) => MigrationOutcome::Committed {
                transferred: report.transferred,
            },
            Err(e) => MigrationOutcome::Failed {
                reason: e.to_string(),
            },
        };
        self.migrations.lock().insert(migration_id, outcome);

        let report = result?;
        Ok(ControlResponse::MoveDataComplete {
            migration_id: report.migration_id,
            transferred: report.transferred,
        })
    }

    /// Report how a migration ended. A migration this node never saw is
    /// fenced so that a late MOVE_DATA for it is refused.
    fn resolve_migration(&self, migration_id: MigrationId) -> ControlResponse {
        let outcome = self
            .migrations
            .lock()
            .entry(migration_id)
            .or_insert(MigrationOutcome::Fenced)
            .clone();
        info!(node = %self.identity, migration_id, ?outcome, "Resolved migration");
        ControlResponse::MigrationResolved {
            migration_id,
            outcome,
        }
    }

    /// Gate and serve a client request.
    pub fn handle_client(&self, request: ClientRequest) -> ClientResponse {
        // The state lock is held across the storage access so that no write
        // lands after LOCK_WRITE has been acknowledged.
        let state = self.state.read();

        if self.is_terminated() || *state == NodeState::Stopped {
            return ClientResponse::ServerStopped;
        }
        if matches!(request, ClientRequest::Put { .. }) && *state == NodeState::WriteLocked {
            return ClientResponse::ServerWriteLock;
        }

        if let Some(handoff) = self.handoff.read().as_ref() {
            if handoff.range.contains(hash_key(request.key().as_bytes())) {
                return ClientResponse::ServerNotResponsible {
                    metadata: handoff.metadata.clone(),
                };
            }
        }

        {
            let metadata = self.metadata.read();
            if !metadata.is_responsible(&self.identity, request.key()) {
                return ClientResponse::ServerNotResponsible {
                    metadata: metadata.serialize(),
                };
            }
        }

        match request {
            ClientRequest::Get { key } => match self.storage.get(&key) {
                Some(value) => ClientResponse::GetSuccess { key, value },
                None => ClientResponse::GetError { key },
            },
            ClientRequest::Put { key, .. } if key.is_empty() => ClientResponse::PutError {
                key,
                reason: "empty key".to_string(),
            },
            ClientRequest::Put { key, value } if value == DELETE_SENTINEL => {
                match self.storage.put(&key, &value) {
                    Some(_) => ClientResponse::DeleteSuccess { key },
                    None => ClientResponse::DeleteError { key },
                }
            }
            ClientRequest::Put { key, value } => match self.storage.put(&key, &value) {
                None => ClientResponse::PutSuccess { key },
                Some(_) => ClientResponse::PutUpdate { key },
            },
        }
    }

    /// Apply a record pushed by another node.
    ///
    /// Peer transfers are accepted in every state until the node is shut
    /// down; the sender is responsible for routing them here.
    pub fn handle_peer(&self, request: PeerRequest) -> PeerResponse {
        if self.is_terminated() {
            return PeerResponse::Failed {
                reason: StateError::Terminated.to_string(),
            };
        }

        match request {
            PeerRequest::Put { key, value } => {
                self.storage.put(&key, &value);
                PeerResponse::Stored
            }
            PeerRequest::Delete { key } => PeerResponse::Deleted {
                existed: self.storage.put(&key, DELETE_SENTINEL).is_some(),
            },
            PeerRequest::PutAll(batch) => PeerResponse::Ack(apply_batch(&self.storage, &batch)),
            PeerRequest::Revert { migration_id, keys } => PeerResponse::Reverted {
                migration_id,
                removed: revert_keys(&self.storage, migration_id, &keys),
            },
        }
    }
}

impl std::fmt::Debug for NodeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeController")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("entries", &self.storage.len())
            .finish()
    }
}
