//! End-to-end tests for the storage service.
//!
//! Every test runs a whole cluster inside the test runtime: nodes are
//! launched in-process on OS-assigned ports and driven by a real
//! [`ClusterController`](crate::cluster::ClusterController) over TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TestCluster                             │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                  ClusterController                         │ │
//! │  │  - init_service / start / stop                             │ │
//! │  │  - add_node / remove_server / shut_down                    │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │                             │                                   │
//! │                             ▼                                   │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                  InProcessLauncher                         │ │
//! │  │  - KvNode per machine, 127.0.0.1:<os port>                │ │
//! │  │  - direct access to each node's storage                   │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod cluster_e2e_tests;
mod utils;
