#![deny(missing_docs)]

//! Storage-engine and transaction contracts consumed by the execution
//! compiler, plus the in-memory engine the test suites run against.
//!
//! Architecture role:
//! - [`Engine`] / [`Database`] / [`Relation`] / [`Reader`]: the storage seam
//! - [`TxnClient`] / [`TxnOperator`]: the transaction seam
//! - [`FileService`]: staged-block storage for distributed writes
//! - [`mem`]: a complete in-memory implementation of all of the above
//!
//! Everything here is a contract the compiler consumes; real engines live in
//! other repositories.

/// In-memory engine implementation.
pub mod mem;
/// Opaque block-range descriptor layout.
pub mod range;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidal_common::{MemoryPool, Result};
use tidal_plan::{Expr, TableDef};

pub use range::BlockRange;

/// Name of the synthetic row-id column readers append for DML pipelines.
pub const ROW_ID_COL: &str = "__tidal_row_id";

/// Key-column name selecting the block-meta delete protocol on
/// [`Relation::delete`]: the batch carries per-block row-id payloads rather
/// than bare row ids.
pub const BLOCK_META_ID: &str = "__tidal_block_meta_id";

/// Hybrid logical timestamp used for snapshots and commit ordering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Physical component (nanoseconds).
    pub physical: i64,
    /// Logical tie-breaker.
    pub logical: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.physical, self.logical)
    }
}

/// Engine behavior hints consumed by the runner.
#[derive(Debug, Clone, Copy)]
pub struct Hints {
    /// Budget for cross-CN commit/rollback round-trips; exceeding it triggers
    /// a rollback attempt and returns the original error.
    pub commit_or_rollback_timeout: Duration,
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            commit_or_rollback_timeout: Duration::from_secs(10),
        }
    }
}

/// Storage-engine family; placement policy differs per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Log-structured cloud engine: range 0 is the memory-resident block and
    /// the rest live in object storage.
    LogStructured,
    /// Plain in-memory engine (temp tables and tests).
    Memory,
}

/// One compute node visible to the compiler, optionally carrying the block
/// ranges placed on it.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Stable node id.
    pub id: u64,
    /// `ip:port` service address.
    pub addr: String,
    /// Worker parallelism available on this node.
    pub mcpu: usize,
    /// Block ranges assigned by placement.
    pub data: Vec<BlockRange>,
}

/// A live transaction handle.
#[async_trait]
pub trait TxnOperator: Send + Sync {
    /// Snapshot timestamp reads run at.
    fn snapshot_ts(&self) -> Timestamp;
    /// Commit timestamp of the most recent commit on this client, for
    /// sync-commit gathering.
    fn commit_ts(&self) -> Timestamp;
    /// Commit the transaction.
    async fn commit(&self) -> Result<()>;
    /// Roll the transaction back.
    async fn rollback(&self) -> Result<()>;
}

/// Transaction client: mints operators.
pub trait TxnClient: Send + Sync {
    /// Begin a fresh transaction.
    fn new_txn(&self) -> Result<Arc<dyn TxnOperator>>;
}

/// Pull-based batch reader over a slice of block ranges.
#[async_trait]
pub trait Reader: Send {
    /// Read the next batch projected to `cols`, or `None` at end of data.
    /// Memory for the returned batch is attributed to `pool` by the caller.
    async fn read(
        &mut self,
        cols: &[String],
        filter: Option<&Expr>,
        pool: &Arc<MemoryPool>,
    ) -> Result<Option<RecordBatch>>;

    /// Release reader resources.
    fn close(&mut self);
}

/// One table inside a database.
#[async_trait]
pub trait Relation: Send + Sync {
    /// Stable table id.
    fn table_id(&self) -> u64;

    /// Engine family backing this relation.
    fn engine_kind(&self) -> EngineKind;

    /// Resolved table definition.
    fn table_def(&self) -> TableDef;

    /// Opaque scannable block descriptors. For log-structured engines element
    /// 0 represents the memory-resident block.
    async fn ranges(&self, filters: &[Expr]) -> Result<Vec<BlockRange>>;

    /// Split `ranges` into up to `parallel` readers.
    async fn new_readers(
        &self,
        parallel: usize,
        filter: Option<Expr>,
        ranges: Vec<BlockRange>,
    ) -> Result<Vec<Box<dyn Reader>>>;

    /// Append a batch of rows.
    async fn write(&self, batch: &RecordBatch) -> Result<()>;

    /// Delete rows. `key_col` selects the protocol: [`ROW_ID_COL`] deletes
    /// the listed row ids; [`BLOCK_META_ID`] consumes per-block meta batches
    /// from a distributed delete (a `None` batch finalizes the stream).
    async fn delete(&self, batch: Option<&RecordBatch>, key_col: &str) -> Result<u64>;

    /// Update rows in place by row id.
    async fn update(
        &self,
        batch: &RecordBatch,
        row_id_col: usize,
        assignments: &[(usize, usize)],
    ) -> Result<u64>;

    /// Install staged blocks by meta-loc (distributed insert commit).
    async fn commit_blocks(&self, meta_locs: &[String], fs: &Arc<dyn FileService>) -> Result<u64>;
}

/// A database (schema) inside an engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a relation by name.
    async fn relation(&self, name: &str) -> Result<Arc<dyn Relation>>;
    /// Create a relation.
    async fn create_relation(&self, def: &TableDef) -> Result<()>;
    /// Replace a relation's definition in place (ALTER TABLE / ALTER VIEW).
    async fn alter_relation(&self, def: &TableDef) -> Result<()>;
    /// Drop a relation.
    async fn drop_relation(&self, name: &str) -> Result<()>;
    /// Remove all rows of a relation, returning the removed count.
    async fn truncate_relation(&self, name: &str) -> Result<u64>;
}

/// The storage engine seam.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a database under `txn`.
    async fn database(&self, name: &str, txn: &Arc<dyn TxnOperator>) -> Result<Arc<dyn Database>>;

    /// Live CN list filtered by tenant and label selector.
    fn nodes(
        &self,
        is_internal: bool,
        tenant: &str,
        cn_label: &HashMap<String, String>,
    ) -> Result<Vec<Node>>;

    /// Engine behavior hints.
    fn hints(&self) -> Hints;

    /// Create a database.
    async fn create_database(&self, name: &str, txn: &Arc<dyn TxnOperator>) -> Result<()>;

    /// Drop a database.
    async fn drop_database(&self, name: &str, txn: &Arc<dyn TxnOperator>) -> Result<()>;
}

/// Staged-block storage used by distributed inserts: workers write sealed
/// blocks under meta-loc keys, the merge scope installs them.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Persist one sealed block under `meta_loc`.
    async fn write_block(&self, meta_loc: &str, batch: RecordBatch) -> Result<()>;
    /// Load a sealed block.
    async fn read_block(&self, meta_loc: &str) -> Result<RecordBatch>;
    /// Object-store request counters snapshot `(writes, reads)`.
    fn io_counts(&self) -> (u64, u64);
}
