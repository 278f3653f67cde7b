//! Partitioned key-value store on a consistent hash ring.
//!
//! This crate provides a small storage service made of:
//! - **Storage nodes** that each own one arc of an MD5 hash ring and serve
//!   GET/PUT for the keys in it
//! - **A cluster controller** that launches nodes, distributes metadata and
//!   moves data between nodes when servers join or leave
//! - **A routing client** that follows `SERVER_NOT_RESPONSIBLE` redirects
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::{
//!     ClusterController, ControllerConfig, InProcessLauncher, KvClient, MachineRepository,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repository = MachineRepository::parse(
//!         "server1 127.0.0.1 50000\nserver2 127.0.0.1 50001\nserver3 127.0.0.1 50002\n",
//!     )?;
//!
//!     let mut controller = ClusterController::new(
//!         repository,
//!         Arc::new(InProcessLauncher::new()),
//!         ControllerConfig::default(),
//!     );
//!
//!     controller.init_service(2).await?;
//!     controller.start().await?;
//!
//!     let seed = controller.nodes()[0].clone();
//!     let mut client = KvClient::connect(seed);
//!     client.put("user:123", "Alice").await?;
//!
//!     // Moves part of the ring to the new node
//!     controller.add_node().await?;
//!     println!("{:?}", client.get("user:123").await?);
//!
//!     controller.shut_down().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │             ClusterController               │
//! │  • init_service / start / stop              │
//! │  • add_node / remove_node / shut_down       │
//! └─────────────────────────────────────────────┘
//!           │ INIT, UPDATE, LOCK_WRITE, MOVE_DATA ...
//!     ┌─────┼───────────────┬───────────────┐
//!     ▼                     ▼               ▼
//! ┌─────────┐  SERVER_PUT ┌─────────┐   ┌─────────┐
//! │ KvNode  │ ──────────▶ │ KvNode  │   │ KvNode  │
//! └─────────┘             └─────────┘   └─────────┘
//!     ▲                     ▲               ▲
//!     └─────────────┬───────┴───────────────┘
//!                   │ GET / PUT
//!              ┌──────────┐
//!              │ KvClient │
//!              └──────────┘
//! ```
//!
//! # Consistency Model
//!
//! - Each key has exactly one owner under a given metadata
//! - Writes to a range are refused while it is being handed over
//! - Nodes may briefly hold stale metadata; clients are redirected

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod rebalancing;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use client::KvClient;
pub use config::{ControllerConfig, NodeConfig, RetryConfig};
pub use error::{Error, Result};
pub use node::{KvNode, KvNodeHandle, NodeController};
pub use types::{MigrationId, NodeState, ServerIdentity};

// Re-export cluster types
pub use cluster::{
    ClusterController, ClusterEvent, ClusterEventListener, InProcessLauncher,
    LoggingEventListener, MachineRepository, NodeLauncher, NoopEventListener, ProcessLauncher,
};

// Re-export partitioning types
pub use partitioning::{ClusterMetadata, HashRing, KeyRange};

// Re-export storage types
pub use storage::{Mapping, StorageEngine, DELETE_SENTINEL};

// Re-export rebalancing types
pub use rebalancing::{
    MigrationOutcome, MigrationPlan, RebalanceCoordinator, RebalanceError, RebalanceOperation,
    RebalanceState, RebalanceType, TransferBatch, TransferEntry, TransferProgress,
};
