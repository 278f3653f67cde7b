//! Node-to-node transfer of key ranges.
//!
//! The donor selects the range from its storage, streams it to the
//! destination in size-bounded batches, and deletes its own copy only after
//! the destination acknowledged every batch of the migration. A failed
//! transfer leaves the donor untouched and asks the destination to drop
//! whatever it already received, so each record lives on its owner only.

use crate::error::{Error, MigrationError, ProtocolError, Result};
use crate::network::client::RpcClient;
use crate::network::rpc::{MoveDataRequest, PeerRequest, PeerResponse};
use crate::storage::{Mapping, StorageEngine, DELETE_SENTINEL};
use crate::types::{MigrationId, ServerIdentity};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Bytes reserved in every batch frame for headers and enum tags.
const BATCH_OVERHEAD: usize = 64;

/// Per-entry encoding overhead (two length prefixes).
const ENTRY_OVERHEAD: usize = 16;

/// A record being transferred between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    /// The record key.
    pub key: String,

    /// The record value.
    pub value: String,
}

impl TransferEntry {
    /// Create a new transfer entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Approximate encoded size.
    pub fn encoded_len(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// A batch of entries belonging to one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBatch {
    /// The migration this batch belongs to.
    pub migration_id: MigrationId,

    /// The batch sequence number, starting at 0.
    pub sequence: u32,

    /// Entries in this batch.
    pub entries: Vec<TransferEntry>,

    /// Whether this is the last batch.
    pub is_final: bool,
}

impl TransferBatch {
    /// Create a new transfer batch.
    pub fn new(
        migration_id: MigrationId,
        sequence: u32,
        entries: Vec<TransferEntry>,
        is_final: bool,
    ) -> Self {
        Self {
            migration_id,
            sequence,
            entries,
            is_final,
        }
    }

    /// Create an empty final batch.
    pub fn empty_final(migration_id: MigrationId, sequence: u32) -> Self {
        Self::new(migration_id, sequence, Vec::new(), true)
    }

    /// Get the number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries as a mapping ready for `bulk_insert`.
    pub fn to_mapping(&self) -> Mapping {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }
}

/// Acknowledgement the destination returns for each applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    /// The migration being acknowledged.
    pub migration_id: MigrationId,

    /// The acknowledged batch.
    pub sequence: u32,

    /// Number of entries stored.
    pub applied: usize,
}

/// Progress of an ongoing transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// The migration ID.
    pub migration_id: MigrationId,

    /// Total entries to transfer.
    pub total_entries: usize,

    /// Entries acknowledged so far.
    pub transferred_entries: usize,

    /// Batches sent.
    pub batches_sent: u32,

    /// Batches acknowledged.
    pub batches_acked: u32,
}

impl TransferProgress {
    /// Create a new progress tracker.
    pub fn new(migration_id: MigrationId, total_entries: usize) -> Self {
        Self {
            migration_id,
            total_entries,
            transferred_entries: 0,
            batches_sent: 0,
            batches_acked: 0,
        }
    }

    /// Get the progress percentage.
    pub fn percentage(&self) -> f64 {
        if self.total_entries == 0 {
            100.0
        } else {
            (self.transferred_entries as f64 / self.total_entries as f64) * 100.0
        }
    }

    /// Record an acknowledged batch.
    pub fn update(&mut self, entries: usize) {
        self.transferred_entries += entries;
        self.batches_acked += 1;
    }
}

/// How a migration ended, as recorded by its donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    /// Every batch was acknowledged and the donor dropped its copy.
    Committed { transferred: usize },
    /// The transfer failed; the donor kept its copy.
    Failed { reason: String },
    /// The migration never ran and will be refused if it arrives later.
    Fenced,
}

impl MigrationOutcome {
    /// Whether the range now lives on the destination.
    pub fn is_committed(&self) -> bool {
        matches!(self, MigrationOutcome::Committed { .. })
    }
}

/// Outcome of a completed range transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// The migration ID.
    pub migration_id: MigrationId,

    /// Records delivered to the destination.
    pub transferred: usize,

    /// Records deleted locally after acknowledgement.
    pub removed: usize,

    /// Number of batches sent.
    pub batches: u32,
}

/// Split a mapping into batches whose payload stays under `budget` bytes.
///
/// Keys are emitted in sorted order. The last batch is marked final; an
/// empty mapping still yields one empty final batch.
pub fn split_into_batches(
    migration_id: MigrationId,
    mapping: &Mapping,
    budget: usize,
    max_message_size: usize,
) -> std::result::Result<Vec<TransferBatch>, MigrationError> {
    let hard_limit = max_message_size.saturating_sub(BATCH_OVERHEAD);
    let budget = budget.min(hard_limit).max(1);

    let mut keys: Vec<&String> = mapping.keys().collect();
    keys.sort();

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for key in keys {
        let entry = TransferEntry::new(key.clone(), mapping[key].clone());
        let size = entry.encoded_len();
        if size > hard_limit {
            return Err(MigrationError::RecordTooLarge {
                key: entry.key,
                size,
            });
        }

        if !current.is_empty() && current_bytes + size > budget {
            let sequence = batches.len() as u32;
            batches.push(TransferBatch::new(
                migration_id,
                sequence,
                std::mem::take(&mut current),
                false,
            ));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(entry);
    }

    let sequence = batches.len() as u32;
    batches.push(TransferBatch::new(migration_id, sequence, current, true));
    Ok(batches)
}

/// Store a received batch and build its acknowledgement.
pub fn apply_batch(storage: &StorageEngine, batch: &TransferBatch) -> TransferAck {
    let applied = storage.bulk_insert(&batch.to_mapping());
    debug!(
        migration_id = batch.migration_id,
        sequence = batch.sequence,
        applied,
        is_final = batch.is_final,
        "Applied transfer batch"
    );
    TransferAck {
        migration_id: batch.migration_id,
        sequence: batch.sequence,
        applied,
    }
}

/// Donor side of a migration step.
pub struct RangeTransfer<'a> {
    storage: &'a StorageEngine,
    rpc: &'a RpcClient,
    batch_bytes: usize,
    max_message_size: usize,
}

impl<'a> RangeTransfer<'a> {
    /// Create a transfer over the donor's storage.
    pub fn new(
        storage: &'a StorageEngine,
        rpc: &'a RpcClient,
        batch_bytes: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            storage,
            rpc,
            batch_bytes,
            max_message_size,
        }
    }

    /// Push the requested range to its destination.
    ///
    /// Local copies are removed only once every batch is acknowledged;
    /// `before_remove` runs right before that. On failure the keys of every
    /// batch sent so far are reverted on the destination before the error
    /// is returned.
    pub async fn push<F>(&self, request: &MoveDataRequest, before_remove: F) -> Result<TransferReport>
    where
        F: FnOnce(),
    {
        let migration_id = request.migration_id;
        let destination = &request.destination;
        let mapping = self.storage.range_select(request.range);
        let batches = split_into_batches(
            migration_id,
            &mapping,
            self.batch_bytes,
            self.max_message_size,
        )?;

        info!(
            migration_id,
            destination = %destination,
            entries = mapping.len(),
            batches = batches.len(),
            "Starting range transfer"
        );

        let mut progress = TransferProgress::new(migration_id, mapping.len());

        if let Err(e) = self.stream(destination, &batches, &mut progress).await {
            let sent = progress.batches_sent as usize;
            return Err(self.revert(destination, &batches[..sent], e).await);
        }

        before_remove();
        let removed = self.storage.bulk_remove(&mapping);

        info!(
            migration_id,
            destination = %destination,
            transferred = progress.transferred_entries,
            removed,
            "Range transfer complete"
        );

        Ok(TransferReport {
            migration_id,
            transferred: mapping.len(),
            removed,
            batches: progress.batches_acked,
        })
    }

    async fn stream(
        &self,
        destination: &ServerIdentity,
        batches: &[TransferBatch],
        progress: &mut TransferProgress,
    ) -> Result<()> {
        let migration_id = progress.migration_id;

        for batch in batches {
            let sequence = batch.sequence;
            // Counted before sending: a batch whose ack was lost may still
            // have been applied.
            progress.batches_sent += 1;

            let reply = self
                .rpc
                .send_peer(destination, PeerRequest::PutAll(batch.clone()))
                .await
                .map_err(|e| MigrationError::TransferFailed {
                    migration_id,
                    reason: e.to_string(),
                })?;

            match reply {
                PeerResponse::Ack(ack)
                    if ack.migration_id == migration_id && ack.sequence == sequence =>
                {
                    progress.update(ack.applied);
                    debug!(
                        migration_id,
                        sequence,
                        percent = progress.percentage(),
                        "Batch acknowledged"
                    );
                }
                PeerResponse::Ack(_) => {
                    return Err(MigrationError::BadAcknowledgement {
                        migration_id,
                        sequence,
                    }
                    .into());
                }
                PeerResponse::Failed { reason } => {
                    warn!(migration_id, sequence, %reason, "Destination rejected batch");
                    return Err(MigrationError::TransferFailed {
                        migration_id,
                        reason,
                    }
                    .into());
                }
                other => {
                    return Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into());
                }
            }
        }

        Ok(())
    }

    /// Drop the keys of `sent` batches on the destination. Returns the
    /// transfer error, extended if the revert could not be completed.
    async fn revert(
        &self,
        destination: &ServerIdentity,
        sent: &[TransferBatch],
        cause: Error,
    ) -> Error {
        let Some(first) = sent.first() else {
            return cause;
        };
        let migration_id = first.migration_id;
        let mut removed = 0;

        for batch in sent.iter().filter(|b| !b.is_empty()) {
            let request = PeerRequest::Revert {
                migration_id,
                keys: batch.entries.iter().map(|e| e.key.clone()).collect(),
            };
            match self.rpc.send_peer(destination, request).await {
                Ok(PeerResponse::Reverted { removed: n, .. }) => removed += n,
                Ok(other) => return revert_failed(cause, format!("{:?}", other)),
                Err(e) => return revert_failed(cause, e.to_string()),
            }
        }

        warn!(
            migration_id,
            destination = %destination,
            batches = sent.len(),
            removed,
            "Reverted partial transfer"
        );
        cause
    }
}

fn revert_failed(cause: Error, reason: String) -> Error {
    match cause {
        Error::Migration(MigrationError::TransferFailed {
            migration_id,
            reason: original,
        }) => {
            error!(migration_id, %reason, "Could not revert partial transfer");
            MigrationError::TransferFailed {
                migration_id,
                reason: format!("{}; revert incomplete: {}", original, reason),
            }
            .into()
        }
        other => {
            error!(%reason, "Could not revert partial transfer");
            other
        }
    }
}

/// Drop reverted keys on the destination.
pub fn revert_keys(storage: &StorageEngine, migration_id: MigrationId, keys: &[String]) -> usize {
    let removed = storage.remove_keys(keys);
    debug!(migration_id, keys = keys.len(), removed, "Reverted transfer batch");
    removed
}

/// Store a single record on another node.
pub async fn push_record(
    rpc: &RpcClient,
    destination: &ServerIdentity,
    key: &str,
    value: &str,
) -> Result<()> {
    if value == DELETE_SENTINEL {
        delete_record(rpc, destination, key).await?;
        return Ok(());
    }

    let request = PeerRequest::Put {
        key: key.to_string(),
        value: value.to_string(),
    };
    match rpc.send_peer(destination, request).await? {
        PeerResponse::Stored => Ok(()),
        PeerResponse::Failed { reason } => Err(ProtocolError::Failed(reason).into()),
        other => Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
    }
}

/// Delete a single record on another node. Returns whether it existed.
pub async fn delete_record(rpc: &RpcClient, destination: &ServerIdentity, key: &str) -> Result<bool> {
    let request = PeerRequest::Delete {
        key: key.to_string(),
    };
    match rpc.send_peer(destination, request).await? {
        PeerResponse::Deleted { existed } => Ok(existed),
        PeerResponse::Failed { reason } => Err(ProtocolError::Failed(reason).into()),
        other => Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
    }
}
