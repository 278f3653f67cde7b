//! Concurrent per-node key-value storage.

use crate::partitioning::{hash_key, KeyRange};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value that turns a put into a delete.
pub const DELETE_SENTINEL: &str = "null";

/// A set of records moved as a unit during migration.
pub type Mapping = HashMap<String, String>;

/// A stored value together with the ring position of its key.
#[derive(Debug, Clone)]
struct StoredValue {
    position: u32,
    value: String,
}

/// Storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of stored records.
    pub entry_count: u64,
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
}

/// Key-value map for one node, sharded internally so client handlers and a
/// running migration scan never contend on a single lock.
#[derive(Debug, Default)]
pub struct StorageEngine {
    /// The records, keyed by client key.
    records: DashMap<String, StoredValue>,

    /// Hit counter for statistics.
    hits: AtomicU64,

    /// Miss counter for statistics.
    misses: AtomicU64,
}

impl StorageEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, update or delete a record.
    ///
    /// A value of `"null"` deletes the key. Returns the value previously
    /// stored under the key, if any.
    pub fn put(&self, key: &str, value: &str) -> Option<String> {
        if value == DELETE_SENTINEL {
            return self.records.remove(key).map(|(_, stored)| stored.value);
        }

        let stored = StoredValue {
            position: hash_key(key.as_bytes()),
            value: value.to_string(),
        };
        self.records
            .insert(key.to_string(), stored)
            .map(|previous| previous.value)
    }

    /// Look up a record.
    pub fn get(&self, key: &str) -> Option<String> {
        let result = self.records.get(key).map(|stored| stored.value.clone());

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Check if a key exists without touching the statistics.
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Collect every record whose key hashes into `range`.
    ///
    /// The scan runs concurrently with writers: records inserted or removed
    /// while it runs may or may not be included, but no record is altered.
    pub fn range_select(&self, range: KeyRange) -> Mapping {
        self.records
            .iter()
            .filter(|entry| range.contains(entry.value().position))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Merge records into the store, overwriting existing keys.
    pub fn bulk_insert(&self, mapping: &Mapping) -> usize {
        for (key, value) in mapping {
            let stored = StoredValue {
                position: hash_key(key.as_bytes()),
                value: value.clone(),
            };
            self.records.insert(key.clone(), stored);
        }
        mapping.len()
    }

    /// Delete every key of `mapping`. Returns how many were present.
    pub fn bulk_remove(&self, mapping: &Mapping) -> usize {
        mapping
            .keys()
            .filter(|key| self.records.remove(key.as_str()).is_some())
            .count()
    }

    /// Delete the listed keys. Returns how many were present.
    pub fn remove_keys(&self, keys: &[String]) -> usize {
        keys.iter()
            .filter(|key| self.records.remove(key.as_str()).is_some())
            .count()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Storage statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            entry_count: self.records.len() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
