//! Rebalancing module for data transfer during membership changes.
//!
//! A join or leave moves exactly one ring interval between two nodes. The
//! [`RebalanceCoordinator`] plans that move and tracks its state; the donor
//! node performs it with [`RangeTransfer`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  RebalanceCoordinator                        │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 1: Plan                                        │  │
//! │  │  - Snapshot current metadata                          │  │
//! │  │  - Compute donor, destination and (pred, pos] range   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 2: Stream (on the write-locked donor)          │  │
//! │  │  - range_select, split into PUT_ALL batches           │  │
//! │  │  - wait for an Ack per batch                          │  │
//! │  │  - bulk_remove only after the final Ack               │  │
//! │  │  - on failure, SERVER_REVERT the batches already sent │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Phase 3: Commit                                      │  │
//! │  │  - Broadcast UPDATE with the new metadata             │  │
//! │  │  - Unlock the donor                                   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod coordinator;
mod transfer;

pub use coordinator::{
    MigrationPlan, RebalanceCoordinator, RebalanceError, RebalanceOperation,
    RebalanceOperationInfo, RebalanceState, RebalanceType,
};
pub use transfer::{
    apply_batch, delete_record, push_record, revert_keys, split_into_batches, MigrationOutcome,
    RangeTransfer, TransferAck, TransferBatch, TransferEntry, TransferProgress, TransferReport,
};
