//! Cluster controller: launches nodes and orchestrates membership changes.

use crate::cluster::events::{ClusterEvent, ClusterEventListener, LoggingEventListener};
use crate::cluster::launcher::NodeLauncher;
use crate::cluster::repository::MachineRepository;
use crate::config::ControllerConfig;
use crate::error::{ClusterError, Error, MigrationError, ProtocolError, Result};
use crate::network::client::RpcClient;
use crate::network::rpc::{ControlRequest, ControlResponse};
use crate::partitioning::ClusterMetadata;
use crate::rebalancing::{
    MigrationOutcome, MigrationPlan, RebalanceCoordinator, RebalanceOperation,
};
use crate::types::ServerIdentity;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Owns the authoritative metadata and drives every node through INIT,
/// START/STOP, joins, leaves and shutdown.
///
/// Operations take `&mut self`: one topology change runs at a time.
pub struct ClusterController {
    /// Controller settings.
    config: ControllerConfig,

    /// Machines nodes can run on.
    repository: MachineRepository,

    /// Starts node processes.
    launcher: Arc<dyn NodeLauncher>,

    /// Control channel to nodes.
    rpc: RpcClient,

    /// MOVE_DATA channel; sends each migration at most once.
    transfer_rpc: RpcClient,

    /// Channel for asking a donor how a migration ended.
    resolve_rpc: RpcClient,

    /// Authoritative metadata.
    metadata: ClusterMetadata,

    /// Plans and tracks migrations.
    coordinator: RebalanceCoordinator,

    /// Receives topology events.
    listener: Arc<dyn ClusterEventListener>,

    /// Whether START was broadcast more recently than STOP.
    running: bool,
}

impl ClusterController {
    /// Create a controller over a machine pool.
    pub fn new(
        repository: MachineRepository,
        launcher: Arc<dyn NodeLauncher>,
        config: ControllerConfig,
    ) -> Self {
        let rpc = RpcClient::new(config.retry.clone());
        let transfer_rpc = RpcClient::new(config.transfer_retry()).at_most_once();
        let resolve_rpc = RpcClient::new(config.resolve_retry());
        Self {
            config,
            repository,
            launcher,
            rpc,
            transfer_rpc,
            resolve_rpc,
            metadata: ClusterMetadata::new(),
            coordinator: RebalanceCoordinator::new(),
            listener: Arc::new(LoggingEventListener),
            running: false,
        }
    }

    /// Replace the event listener.
    pub fn with_listener(mut self, listener: Arc<dyn ClusterEventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Current authoritative metadata.
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// Nodes in the ring, in insertion order.
    pub fn nodes(&self) -> &[ServerIdentity] {
        self.metadata.servers()
    }

    /// The machine pool.
    pub fn repository(&self) -> &MachineRepository {
        &self.repository
    }

    /// Migration bookkeeping.
    pub fn coordinator(&self) -> &RebalanceCoordinator {
        &self.coordinator
    }

    /// Whether the cluster is serving clients.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Launch `count` nodes on random machines and INIT them.
    ///
    /// Nodes stay Stopped until [`start`](Self::start). A machine whose node
    /// fails to launch is set aside and another one is tried. If the pool
    /// runs out before `count` nodes are up, every launched node is
    /// terminated and the service stays uninitialized.
    pub async fn init_service(&mut self, count: usize) -> Result<()> {
        if !self.metadata.is_empty() {
            return Err(ClusterError::AlreadyInitialized.into());
        }
        if count == 0 {
            return Err(Error::Config("cannot initialize zero nodes".to_string()));
        }
        if count > self.repository.available_count() {
            return Err(ClusterError::NoMachineAvailable.into());
        }

        info!(count, "Initializing storage service");

        let mut failed = Vec::new();
        while self.metadata.len() < count {
            let Some(machine) = self.repository.take_random() else {
                break;
            };

            let launched = match self.launcher.launch(&machine).await {
                Ok(()) => self.metadata.add_server(machine.clone()).map_err(Error::from),
                Err(e) => Err(e),
            };

            match launched {
                Ok(()) => self.emit(ClusterEvent::NodeLaunched { node: machine }),
                Err(e) => {
                    self.degrade(&machine, "LAUNCH", &e);
                    if let Err(e) = self.launcher.terminate(&machine).await {
                        warn!(node = %machine, error = %e, "Failed to terminate node");
                    }
                    failed.push(machine);
                }
            }
        }

        for machine in &failed {
            self.repository.release(machine);
        }

        if self.metadata.len() < count {
            let launched = self.metadata.len();
            warn!(
                requested = count,
                launched,
                failed = failed.len(),
                "Not enough nodes launched, rolling back"
            );
            for node in self.metadata.servers().to_vec() {
                if let Err(e) = self.launcher.terminate(&node).await {
                    warn!(%node, error = %e, "Failed to terminate node");
                }
                self.repository.release(&node);
            }
            self.metadata = ClusterMetadata::new();
            return Err(ClusterError::InsufficientNodes {
                requested: count,
                launched,
            }
            .into());
        }

        self.wait_for_launch().await;

        let init = ControlRequest::Init {
            metadata: self.metadata.serialize(),
        };
        let targets = self.metadata.servers().to_vec();
        self.broadcast(&targets, init).await;

        info!(nodes = self.metadata.len(), metadata = %self.metadata, "Storage service initialized");
        Ok(())
    }

    /// Broadcast START to every node.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let targets = self.metadata.servers().to_vec();
        self.broadcast(&targets, ControlRequest::Start).await;
        self.running = true;
        Ok(())
    }

    /// Broadcast STOP to every node.
    pub async fn stop(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let targets = self.metadata.servers().to_vec();
        self.broadcast(&targets, ControlRequest::Stop).await;
        self.running = false;
        Ok(())
    }

    /// Add a node on a random idle machine.
    ///
    /// The successor of the new ring position hands over `(predecessor, new]`
    /// while write-locked. If anything before the metadata commit fails, the
    /// donor is unlocked, the new node is shut down and the old metadata
    /// stays in force. When the donor cannot say whether the range moved,
    /// both nodes are left as they are for an operator to recover.
    pub async fn add_node(&mut self) -> Result<ServerIdentity> {
        self.ensure_initialized()?;
        let machine = self
            .repository
            .take_random()
            .ok_or(ClusterError::NoMachineAvailable)?;

        let operation = match self.coordinator.start_node_join(&self.metadata, machine.clone()) {
            Ok(operation) => operation,
            Err(e) => {
                self.repository.release(&machine);
                return Err(e);
            }
        };

        info!(node = %machine, migration_id = operation.id, "Adding node");

        let mut donor_locked = None;
        if let Err(e) = self.join(&machine, &operation, &mut donor_locked).await {
            if e.is_outcome_unknown() {
                let stranded: Vec<_> = donor_locked.iter().chain([&machine]).cloned().collect();
                self.hold_for_recovery(&stranded, &e);
            } else {
                self.abort_join(&machine, donor_locked.as_ref(), &e).await;
            }
            return Err(e);
        }

        self.metadata = self.coordinator.commit()?;
        self.publish_metadata(None).await;

        if let Some(donor) = &donor_locked {
            if let Err(e) = self.send(donor, ControlRequest::UnlockWrite).await {
                self.degrade(donor, "UNLOCK_WRITE", &e);
            }
        }

        if self.running {
            if let Err(e) = self.send(&machine, ControlRequest::Start).await {
                self.degrade(&machine, "START", &e);
            }
        }

        let finished = self.coordinator.finish()?;
        if let Some(plan) = &finished.plan {
            self.emit(ClusterEvent::MigrationCompleted {
                migration_id: plan.migration_id,
                donor: plan.donor.clone(),
                destination: plan.destination.clone(),
                transferred: finished.transferred,
            });
        }
        self.emit(ClusterEvent::NodeJoined {
            node: machine.clone(),
            migration_id: finished.plan.as_ref().map(|p| p.migration_id),
        });

        Ok(machine)
    }

    async fn join(
        &self,
        machine: &ServerIdentity,
        operation: &RebalanceOperation,
        donor_locked: &mut Option<ServerIdentity>,
    ) -> Result<()> {
        self.launcher.launch(machine).await?;
        self.emit(ClusterEvent::NodeLaunched {
            node: machine.clone(),
        });
        self.wait_for_launch().await;

        self.send(
            machine,
            ControlRequest::Init {
                metadata: operation.new_metadata.serialize(),
            },
        )
        .await?;

        match &operation.plan {
            Some(plan) => {
                self.send(&plan.donor, ControlRequest::LockWrite).await?;
                *donor_locked = Some(plan.donor.clone());
                self.migrate(plan, &operation.new_metadata).await?;
            }
            None => self.coordinator.skip_transfer()?,
        }

        Ok(())
    }

    async fn abort_join(
        &mut self,
        machine: &ServerIdentity,
        donor_locked: Option<&ServerIdentity>,
        error: &Error,
    ) {
        warn!(node = %machine, error = %error, "Join failed, rolling back");
        self.degrade(machine, "ADD_NODE", error);

        if let Some(donor) = donor_locked {
            if let Err(e) = self.send(donor, ControlRequest::UnlockWrite).await {
                self.degrade(donor, "UNLOCK_WRITE", &e);
            }
        }

        if let Err(e) = self.send(machine, ControlRequest::Shutdown).await {
            debug!(node = %machine, error = %e, "New node did not acknowledge SHUTDOWN");
        }
        if let Err(e) = self.launcher.terminate(machine).await {
            warn!(node = %machine, error = %e, "Failed to terminate node");
        }
        self.repository.release(machine);

        let _ = self.coordinator.fail(error.to_string());
        let _ = self.coordinator.finish();
    }

    /// Remove a random node.
    pub async fn remove_node(&mut self) -> Result<ServerIdentity> {
        self.ensure_initialized()?;
        let servers = self.metadata.servers();
        let victim = servers[rand::rng().random_range(0..servers.len())].clone();
        self.remove_server(&victim).await?;
        Ok(victim)
    }

    /// Remove a specific node.
    ///
    /// The departing node is write-locked and pushes its range to its
    /// successor before the remaining nodes receive the new metadata. On a
    /// failed migration it is unlocked and stays in the ring, unless the
    /// outcome is unknown, in which case it stays locked.
    pub async fn remove_server(&mut self, leaving: &ServerIdentity) -> Result<()> {
        self.ensure_initialized()?;
        let operation = self.coordinator.start_node_leave(&self.metadata, leaving)?;
        let Some(plan) = operation.plan.clone() else {
            let _ = self.coordinator.cancel();
            let _ = self.coordinator.finish();
            return Err(ClusterError::UnknownNode(leaving.to_string()).into());
        };

        info!(node = %leaving, migration_id = plan.migration_id, "Removing node");

        let drained = match self.send(leaving, ControlRequest::LockWrite).await {
            Ok(_) => self.migrate(&plan, &operation.new_metadata).await,
            Err(e) => Err(e),
        };

        if let Err(e) = drained {
            if e.is_outcome_unknown() {
                self.hold_for_recovery(&[leaving.clone(), plan.destination.clone()], &e);
                return Err(e);
            }
            self.degrade(leaving, "REMOVE_NODE", &e);
            if let Err(unlock) = self.send(leaving, ControlRequest::UnlockWrite).await {
                self.degrade(leaving, "UNLOCK_WRITE", &unlock);
            }
            let _ = self.coordinator.fail(e.to_string());
            let _ = self.coordinator.finish();
            return Err(e);
        }

        self.metadata = self.coordinator.commit()?;
        self.publish_metadata(Some(leaving)).await;

        if let Err(e) = self.send(leaving, ControlRequest::Shutdown).await {
            self.degrade(leaving, "SHUTDOWN", &e);
        }
        if let Err(e) = self.launcher.terminate(leaving).await {
            warn!(node = %leaving, error = %e, "Failed to terminate node");
        }
        self.repository.release(leaving);

        let finished = self.coordinator.finish()?;
        self.emit(ClusterEvent::MigrationCompleted {
            migration_id: plan.migration_id,
            donor: plan.donor.clone(),
            destination: plan.destination.clone(),
            transferred: finished.transferred,
        });
        self.emit(ClusterEvent::NodeRemoved {
            node: leaving.clone(),
            migration_id: plan.migration_id,
        });

        Ok(())
    }

    /// Shut every node down and return all machines to the pool.
    pub async fn shut_down(&mut self) -> Result<()> {
        let targets = self.metadata.servers().to_vec();
        info!(nodes = targets.len(), "Shutting down storage service");

        self.broadcast(&targets, ControlRequest::Shutdown).await;
        for node in &targets {
            if let Err(e) = self.launcher.terminate(node).await {
                warn!(%node, error = %e, "Failed to terminate node");
            }
        }

        self.repository.release_all();
        self.metadata = ClusterMetadata::new();
        self.running = false;
        Ok(())
    }

    /// Run MOVE_DATA on the donor. Returns the number of records moved.
    ///
    /// MOVE_DATA is sent once. If its reply is lost the donor is asked for
    /// the recorded outcome, which also fences a MOVE_DATA still in flight.
    async fn migrate(&self, plan: &MigrationPlan, new_metadata: &ClusterMetadata) -> Result<usize> {
        self.coordinator.begin_streaming()?;
        let migration_id = plan.migration_id;

        let request = ControlRequest::MoveData(plan.to_request(new_metadata));
        debug!(donor = %plan.donor, command = %request, "Sending control command");

        let transferred = match self.transfer_rpc.send_control(&plan.donor, request).await {
            Ok(ControlResponse::MoveDataComplete {
                migration_id: id,
                transferred,
            }) if id == migration_id => transferred,
            Ok(ControlResponse::Failed { reason }) => {
                return Err(MigrationError::TransferFailed {
                    migration_id,
                    reason,
                }
                .into());
            }
            Ok(other) => {
                let cause: Error = ProtocolError::UnexpectedReply(format!("{:?}", other)).into();
                self.resolve_migration(plan, cause).await?
            }
            Err(e) => self.resolve_migration(plan, e).await?,
        };

        self.coordinator.complete_transfer(migration_id, transferred)?;
        Ok(transferred)
    }

    async fn resolve_migration(&self, plan: &MigrationPlan, cause: Error) -> Result<usize> {
        let migration_id = plan.migration_id;
        warn!(
            migration_id,
            donor = %plan.donor,
            error = %cause,
            "No MOVE_DATA reply, resolving outcome"
        );

        let request = ControlRequest::ResolveMigration { migration_id };
        let reply = self.resolve_rpc.send_control(&plan.donor, request).await;

        match reply {
            Ok(ControlResponse::MigrationResolved {
                migration_id: id,
                outcome,
            }) if id == migration_id => match outcome {
                MigrationOutcome::Committed { transferred } => {
                    info!(migration_id, transferred, "Migration committed, reply was lost");
                    Ok(transferred)
                }
                MigrationOutcome::Failed { reason } => Err(MigrationError::TransferFailed {
                    migration_id,
                    reason,
                }
                .into()),
                MigrationOutcome::Fenced => Err(MigrationError::TransferFailed {
                    migration_id,
                    reason: format!("never started: {}", cause),
                }
                .into()),
            },
            Ok(other) => Err(MigrationError::OutcomeUnknown {
                migration_id,
                reason: format!("{}; resolve answered {:?}", cause, other),
            }
            .into()),
            Err(e) => Err(MigrationError::OutcomeUnknown {
                migration_id,
                reason: format!("{}; resolve failed: {}", cause, e),
            }
            .into()),
        }
    }

    /// Give up on a migration whose outcome is unknown. The nodes keep
    /// their state and machines, and the old metadata stays in force.
    fn hold_for_recovery(&self, nodes: &[ServerIdentity], error: &Error) {
        error!(
            nodes = ?nodes.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
            error = %error,
            "Migration outcome unknown, leaving nodes for recovery"
        );
        for node in nodes {
            self.degrade(node, "MOVE_DATA", error);
        }
        let _ = self.coordinator.fail(error.to_string());
        let _ = self.coordinator.finish();
    }

    async fn publish_metadata(&self, skip: Option<&ServerIdentity>) {
        let update = ControlRequest::Update {
            metadata: self.metadata.serialize(),
        };
        let targets: Vec<_> = self
            .metadata
            .servers()
            .iter()
            .filter(|s| Some(*s) != skip)
            .cloned()
            .collect();

        self.broadcast(&targets, update).await;
        self.emit(ClusterEvent::MetadataUpdated {
            metadata: self.metadata.serialize(),
        });
    }

    /// Send a command to each target in turn; failures are logged and
    /// reported, never fatal. Returns how many nodes failed.
    async fn broadcast(&self, targets: &[ServerIdentity], request: ControlRequest) -> usize {
        let command = request.name();
        let mut failures = 0;

        for node in targets {
            if let Err(e) = self.send(node, request.clone()).await {
                self.degrade(node, command, &e);
                failures += 1;
            }
        }

        debug!(command, nodes = targets.len(), failures, "Broadcast complete");
        failures
    }

    async fn send(&self, node: &ServerIdentity, request: ControlRequest) -> Result<ControlResponse> {
        debug!(%node, command = %request, "Sending control command");
        match self.rpc.send_control(node, request).await? {
            ControlResponse::Failed { reason } => Err(ProtocolError::Failed(reason).into()),
            reply => Ok(reply),
        }
    }

    async fn wait_for_launch(&self) {
        if !self.config.launch_grace.is_zero() {
            tokio::time::sleep(self.config.launch_grace).await;
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.metadata.is_empty() {
            return Err(ClusterError::NotInitialized.into());
        }
        Ok(())
    }

    fn degrade(&self, node: &ServerIdentity, command: &'static str, error: &Error) {
        self.emit(ClusterEvent::NodeDegraded {
            node: node.clone(),
            command,
            reason: error.to_string(),
        });
    }

    fn emit(&self, event: ClusterEvent) {
        self.listener.on_event(event);
    }
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("metadata", &self.metadata.serialize())
            .field("running", &self.running)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
