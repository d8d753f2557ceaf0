//! Durable strand store, transactional outbox queue, and the coefficient and
//! subscription tables.
//!
//! One [`redb`] database per process holds every piece of durable state. An
//! append commits the strand, its secondary indexes, and its outbox entry in
//! a single write transaction, so on recovery no strand exists without a
//! queue entry and no entry without its strand. redb's single-writer commit
//! discipline is what serializes resonance CAS updates and per-key
//! coefficient updates; readers run on snapshots and observe monotonically
//! non-decreasing state.

mod clock;
mod outbox;
mod store;
mod tables;

pub use clock::{Clock, ManualClock, SystemClock};
pub use outbox::{OutboxItem, OutboxState, RetryPolicy};
pub use store::{LineageEntry, QueueStats, StoreStats, StrandStore, TimeWindow};
pub use tables::{Coefficient, CoefficientBatch, CoefficientKey};

use weft_strand::StrandId;

/// Error taxonomy of the storage layer.
///
/// `Conflict`, `Invalid`, `NotFound`, `VersionConflict`, and `AlreadyBraided`
/// are semantic outcomes callers dispatch on; the remaining variants wrap the
/// underlying engine and are treated as transient by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate strand id {0}")]
    Conflict(StrandId),
    #[error("invalid strand: {0}")]
    Invalid(String),
    #[error("strand not found: {0}")]
    NotFound(StrandId),
    #[error("resonance version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: StrandId,
        expected: u64,
        actual: u64,
    },
    #[error("cluster already braided: {0}")]
    AlreadyBraided(String),
    #[error("queue item not found: {0}")]
    QueueItemNotFound(u64),
    #[error(transparent)]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
