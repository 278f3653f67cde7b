//! Partitioning module for distributing keys across storage nodes.
//!
//! Every server occupies a single position on a 32-bit consistent hash ring.
//! The controller owns the authoritative [`ClusterMetadata`]; each node keeps
//! a cached copy that may briefly lag behind during rebalancing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ClusterMetadata                           │
//! │   "n1,10.0.0.1,5000;n2,10.0.0.2,5000;n3,10.0.0.3,5000"       │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │                    HashRing                           │  │
//! │  │      ┌────┐        ┌────┐        ┌────┐              │  │
//! │  │  ──▶ │ n2 │ ─────▶ │ n1 │ ─────▶ │ n3 │ ──┐ (wraps)  │  │
//! │  │      └────┘        └────┘        └────┘   │          │  │
//! │  │        ▲───────────────────────────────────┘          │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                             │
//! │  Key "user:123" → md5 → 0x5e1a.. → next server clockwise    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use ringstore::partitioning::ClusterMetadata;
//!
//! let metadata = ClusterMetadata::parse("n1,127.0.0.1,5000;n2,127.0.0.1,5001");
//! let owner = metadata.route("user:123").unwrap();
//! assert!(metadata.contains(owner));
//! assert_eq!(metadata.serialize(), "n1,127.0.0.1,5000;n2,127.0.0.1,5001");
//! ```

mod hashring;
mod metadata;

pub use hashring::{hash_key, server_position, HashRing, KeyRange};
pub use metadata::ClusterMetadata;
