//! Local record storage for a single node.

mod engine;

pub use engine::{Mapping, StorageEngine, StorageStats, DELETE_SENTINEL};
