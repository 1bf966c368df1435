//! Persistent identifier store and work queue.
//!
//! One transactional domain holds the internal/foreign key mapping, the
//! initial-document archive, the diff archive, and the durable work queue.
//! The traits here are the capability seam; [`sqlite::SqliteStore`] is the
//! implementation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::error::Transience;
use crate::model::{
    ConflictRecord, Diff, DiffId, DiffOp, DiffOpId, Document, EntityName, ForeignKey, InternalKey,
    SourceName, WorkItem,
};

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("{key} already bound to a different foreign id in {source}")]
    ForeignKeyConflict { key: InternalKey, source: SourceName },
    #[error("diff {0} is not an open conflict")]
    ConflictResolved(DiffId),
    #[error("op {op} does not belong to diff {diff}")]
    ForeignOp { diff: DiffId, op: DiffOpId },
    #[error("lease {0} is no longer held")]
    LeaseLost(Uuid),
    #[error("store row decode failed: {0}")]
    RowDecode(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Unavailable(_) | StoreError::Io { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Claim on one dequeued item; the item stays hidden from other consumers
/// until the claim is completed, abandoned, or its lease duration lapses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub token: Uuid,
    pub item_id: i64,
}

#[derive(Clone, Debug)]
pub struct LeasedItem {
    pub lease: Lease,
    pub item: WorkItem,
    /// Times this item has been abandoned before.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbandonOutcome {
    /// Back at the queue head with the attempt counter bumped.
    Requeued { attempts: u32 },
    /// Attempts reached the retry cap; moved to the dead-letter table.
    DeadLettered,
}

/// Item that exhausted its retries, kept for operator inspection.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub attempts: u32,
    pub error: String,
}

/// Handle factory. Each worker (and the server) owns one handle; handles are
/// not shared across threads.
pub trait Store: Send + Sync {
    fn handle(&self) -> Result<Box<dyn StoreHandle>, StoreError>;
}

/// One connection's view of the store. Reads are snapshot-consistent within
/// a call; every multi-row mutation is atomic.
pub trait StoreHandle: Send {
    fn create_internal_key(&mut self, entity: &EntityName) -> Result<InternalKey, StoreError>;

    fn lookup_internal(&mut self, fk: &ForeignKey) -> Result<Option<InternalKey>, StoreError>;

    /// Bind `fk` to `key`. Re-recording the same binding is a no-op;
    /// binding a different foreign id for the same `(key, source)` is a
    /// conflict.
    fn record_foreign(&mut self, key: &InternalKey, fk: &ForeignKey) -> Result<(), StoreError>;

    fn lookup_foreign(
        &mut self,
        key: &InternalKey,
        source: &SourceName,
    ) -> Result<Option<ForeignKey>, StoreError>;

    /// Destroy `key`, cascading to its foreign keys, initial document and
    /// diffs. Returns the number of rows removed.
    fn delete_internal(&mut self, key: &InternalKey) -> Result<u64, StoreError>;

    fn put_initial(&mut self, key: &InternalKey, doc: &Document) -> Result<(), StoreError>;

    fn get_initial(&mut self, key: &InternalKey) -> Result<Option<Document>, StoreError>;

    /// Archive a diff, recording each op with its accepted flag. Returns the
    /// new diff's id.
    fn put_diff(
        &mut self,
        key: &InternalKey,
        ops: &[(DiffOp<()>, bool)],
    ) -> Result<DiffId, StoreError>;

    fn diff_owner(&mut self, diff: DiffId) -> Result<Option<InternalKey>, StoreError>;

    /// Unresolved diffs that still carry at least one unaccepted op.
    fn list_conflicts(&mut self) -> Result<Vec<ConflictRecord>, StoreError>;

    /// Validate that `ops` belong to `diff` and build the diff a resolution
    /// would apply, in archive order, without mutating anything.
    fn resolve_ops(&mut self, diff: DiffId, ops: &[DiffOpId]) -> Result<Diff<()>, StoreError>;

    /// Accept `ops` and close the conflict.
    fn mark_resolved(&mut self, diff: DiffId, ops: &[DiffOpId]) -> Result<(), StoreError>;

    /// Append to the queue. Items that resolve to the same internal key are
    /// delivered in enqueue order.
    fn enqueue(&mut self, item: &WorkItem) -> Result<(), StoreError>;

    /// Block up to `wait` for an item, hiding it from other consumers for
    /// `lease`.
    fn dequeue(&mut self, wait: Duration, lease: Duration)
        -> Result<Option<LeasedItem>, StoreError>;

    fn complete(&mut self, lease: &Lease) -> Result<(), StoreError>;

    /// Return the item to the queue head with attempts+1, or dead-letter it
    /// once attempts reach `retry_cap`.
    fn abandon(
        &mut self,
        lease: &Lease,
        error: &str,
        retry_cap: u32,
    ) -> Result<AbandonOutcome, StoreError>;

    fn dead_letters(&mut self) -> Result<Vec<DeadLetter>, StoreError>;

    /// Pending (unleased or lease-expired) queue depth.
    fn queue_depth(&mut self) -> Result<u64, StoreError>;
}
