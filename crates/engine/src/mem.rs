//! In-memory engine implementing the full storage/txn contract.
//!
//! Tables hold an unsealed memory block plus a list of sealed blocks, each
//! tagged with a 16-byte object name whose first 7 bytes feed the locality
//! hash. Row ids are `block_no << 32 | offset`; the memory block uses the
//! all-ones block number so CN-generated segment prefixes stay distinct.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Int8Array, UInt64Array};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tidal_common::{MemoryPool, Result, TidalError};
use tidal_plan::{Expr, TableDef};

use crate::range::{self, BlockRange};
use crate::{
    Database, Engine, EngineKind, FileService, Hints, Node, Reader, Relation, Timestamp, TxnClient,
    TxnOperator, BLOCK_META_ID, ROW_ID_COL,
};

/// Block number reserved for the unsealed memory block.
pub const MEM_BLOCK_NO: u64 = u32::MAX as u64;

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// One sealed block.
#[derive(Debug, Clone)]
struct MemBlock {
    object_name: [u8; 16],
    rows: RecordBatch,
}

#[derive(Debug, Default)]
struct TableState {
    mem_rows: Vec<RecordBatch>,
    blocks: Vec<MemBlock>,
    tombstones: HashSet<u64>,
    next_object_seq: u64,
}

/// In-memory table.
pub struct MemTable {
    table_id: u64,
    kind: EngineKind,
    def: TableDef,
    read_delay_ms: AtomicU64,
    state: RwLock<TableState>,
}

impl MemTable {
    fn new(table_id: u64, kind: EngineKind, def: TableDef) -> Arc<Self> {
        Arc::new(Self {
            table_id,
            kind,
            def,
            read_delay_ms: AtomicU64::new(0),
            state: RwLock::new(TableState::default()),
        })
    }

    /// Slow every reader tick down by `ms`; cancellation tests use this to
    /// hold a scan mid-flight.
    pub fn set_read_delay_ms(&self, ms: u64) {
        self.read_delay_ms.store(ms, Ordering::Relaxed);
    }

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.def
                .cols
                .iter()
                .map(|c| Field::new(&c.name, c.data_type.clone(), !c.not_null))
                .collect::<Vec<_>>(),
        ))
    }

    /// Move the unsealed memory rows into sealed blocks of at most
    /// `block_max_rows` rows each. Tests use this to shape block layouts.
    pub fn seal_blocks(&self, block_max_rows: usize) -> Result<usize> {
        let mut state = self.state.write();
        let batches = std::mem::take(&mut state.mem_rows);
        if batches.is_empty() {
            return Ok(0);
        }
        let schema = batches[0].schema();
        let all = arrow::compute::concat_batches(&schema, &batches)
            .map_err(|e| execution(format!("seal concat failed: {e}")))?;
        let mut sealed = 0;
        let mut offset = 0;
        while offset < all.num_rows() {
            let len = block_max_rows.min(all.num_rows() - offset);
            let seq = state.next_object_seq;
            state.next_object_seq += 1;
            let mut object_name = [0u8; 16];
            // First 7 bytes are a time-like prefix; one object per 4 blocks
            // so locality hashing has something to group.
            let prefix = format!("{:07}", seq / 4);
            object_name[..7].copy_from_slice(prefix.as_bytes());
            let tail = format!("{:09}", seq);
            object_name[7..16].copy_from_slice(tail.as_bytes());
            state.blocks.push(MemBlock {
                object_name,
                rows: all.slice(offset, len),
            });
            sealed += 1;
            offset += len;
        }
        Ok(sealed)
    }

    /// Visible (non-tombstoned) rows across every block, projected to the
    /// table schema. Test helper.
    pub fn visible_rows(&self) -> Result<RecordBatch> {
        let state = self.state.read();
        let schema = self.schema();
        let mut batches = Vec::new();
        for (block_no, base, batch) in block_iter(&state) {
            batches.push(strip_tombstones(block_no, base, &batch, &state.tombstones)?);
        }
        arrow::compute::concat_batches(&schema, &batches)
            .map_err(|e| execution(format!("concat failed: {e}")))
    }

    /// Number of visible rows. Test helper.
    pub fn visible_row_count(&self) -> usize {
        self.visible_rows().map(|b| b.num_rows()).unwrap_or(0)
    }

    fn delete_row_ids(&self, ids: &[u64]) -> u64 {
        let mut state = self.state.write();
        let mut removed = 0;
        for id in ids {
            if state.tombstones.insert(*id) {
                removed += 1;
            }
        }
        removed
    }
}

// All unsealed batches share the memory block number; row offsets run across
// them, tracked by the `base` component.
fn block_iter(state: &TableState) -> Vec<(u64, u64, RecordBatch)> {
    let mut out = Vec::new();
    let mut mem_base = 0u64;
    for batch in &state.mem_rows {
        out.push((MEM_BLOCK_NO, mem_base, batch.clone()));
        mem_base += batch.num_rows() as u64;
    }
    for (i, block) in state.blocks.iter().enumerate() {
        out.push((i as u64, 0, block.rows.clone()));
    }
    out
}

fn strip_tombstones(
    block_no: u64,
    base: u64,
    batch: &RecordBatch,
    tombstones: &HashSet<u64>,
) -> Result<RecordBatch> {
    if tombstones.is_empty() {
        return Ok(batch.clone());
    }
    let mask: BooleanArray = (0..batch.num_rows())
        .map(|row| Some(!tombstones.contains(&(block_no << 32 | (base + row as u64)))))
        .collect();
    filter_record_batch(batch, &mask).map_err(|e| execution(format!("filter failed: {e}")))
}

// Append the row-id column so ids survive later tombstone filtering.
fn augment_with_row_ids(block_no: u64, base: u64, batch: &RecordBatch) -> Result<RecordBatch> {
    let ids: UInt64Array = (0..batch.num_rows())
        .map(|row| Some(block_no << 32 | (base + row as u64)))
        .collect();
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.push(Field::new(ROW_ID_COL, DataType::UInt64, false));
    let mut arrays: Vec<ArrayRef> = batch.columns().to_vec();
    arrays.push(Arc::new(ids));
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| execution(format!("row-id augmentation failed: {e}")))
}

// Filter an augmented batch by its materialized row-id column.
fn filter_tombstoned(batch: &RecordBatch, tombstones: &HashSet<u64>) -> Result<RecordBatch> {
    if tombstones.is_empty() {
        return Ok(batch.clone());
    }
    let idx = batch
        .schema()
        .index_of(ROW_ID_COL)
        .map_err(|_| execution("augmented batch missing row ids"))?;
    let ids = batch
        .column(idx)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| execution("row-id column must be uint64"))?;
    let mask: BooleanArray = ids
        .iter()
        .map(|id| Some(!tombstones.contains(&id.unwrap_or(u64::MAX))))
        .collect();
    filter_record_batch(batch, &mask).map_err(|e| execution(format!("filter failed: {e}")))
}

fn project(batch: &RecordBatch, cols: &[String]) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(cols.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(cols.len());
    for name in cols {
        let idx = batch
            .schema()
            .index_of(name)
            .map_err(|_| execution(format!("unknown column '{name}'")))?;
        fields.push(batch.schema().field(idx).clone());
        arrays.push(batch.column(idx).clone());
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| execution(format!("projection failed: {e}")))
}

/// Reader over a fixed list of row-id-augmented block snapshots.
pub struct MemReader {
    pending: Vec<RecordBatch>,
    delay_ms: u64,
    closed: bool,
}

#[async_trait]
impl Reader for MemReader {
    async fn read(
        &mut self,
        cols: &[String],
        _filter: Option<&Expr>,
        _pool: &Arc<MemoryPool>,
    ) -> Result<Option<RecordBatch>> {
        if self.closed {
            return Ok(None);
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.pending.pop() {
            Some(batch) => Ok(Some(project(&batch, cols)?)),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

#[async_trait]
impl Relation for MemTable {
    fn table_id(&self) -> u64 {
        self.table_id
    }

    fn engine_kind(&self) -> EngineKind {
        self.kind
    }

    fn table_def(&self) -> TableDef {
        self.def.clone()
    }

    async fn ranges(&self, _filters: &[Expr]) -> Result<Vec<BlockRange>> {
        let state = self.state.read();
        let mut out = Vec::with_capacity(state.blocks.len() + 1);
        if self.kind == EngineKind::LogStructured {
            // Descriptor 0 is the memory-resident block: prefix only.
            out.push(MEM_BLOCK_NO.to_le_bytes().to_vec());
        }
        for (i, block) in state.blocks.iter().enumerate() {
            out.push(range::encode(i as u64, &block.object_name));
        }
        Ok(out)
    }

    async fn new_readers(
        &self,
        parallel: usize,
        _filter: Option<Expr>,
        ranges: Vec<BlockRange>,
    ) -> Result<Vec<Box<dyn Reader>>> {
        let state = self.state.read();
        let mut assigned: Vec<RecordBatch> = Vec::new();
        for r in &ranges {
            let block_no = range::block_no(r);
            if block_no == MEM_BLOCK_NO {
                let mut base = 0u64;
                for batch in &state.mem_rows {
                    let augmented = augment_with_row_ids(MEM_BLOCK_NO, base, batch)?;
                    base += batch.num_rows() as u64;
                    assigned.push(filter_tombstoned(&augmented, &state.tombstones)?);
                }
            } else {
                let block = state
                    .blocks
                    .get(block_no as usize)
                    .ok_or_else(|| execution(format!("unknown block {block_no}")))?;
                let augmented = augment_with_row_ids(block_no, 0, &block.rows)?;
                assigned.push(filter_tombstoned(&augmented, &state.tombstones)?);
            }
        }
        let parallel = parallel.max(1).min(assigned.len().max(1));
        let mut buckets: Vec<Vec<RecordBatch>> = vec![Vec::new(); parallel];
        for (i, item) in assigned.into_iter().enumerate() {
            buckets[i % parallel].push(item);
        }
        let delay_ms = self.read_delay_ms.load(Ordering::Relaxed);
        Ok(buckets
            .into_iter()
            .map(|pending| {
                Box::new(MemReader {
                    pending,
                    delay_ms,
                    closed: false,
                }) as Box<dyn Reader>
            })
            .collect())
    }

    async fn write(&self, batch: &RecordBatch) -> Result<()> {
        let normalized = self.normalize(batch)?;
        self.state.write().mem_rows.push(normalized);
        Ok(())
    }

    async fn delete(&self, batch: Option<&RecordBatch>, key_col: &str) -> Result<u64> {
        let Some(batch) = batch else {
            // End of a block-meta delete stream; nothing left to flush here.
            return Ok(0);
        };
        if key_col == BLOCK_META_ID {
            return self.delete_block_meta(batch);
        }
        let idx = batch
            .schema()
            .index_of(key_col)
            .map_err(|_| execution(format!("delete key column '{key_col}' missing")))?;
        let ids = batch
            .column(idx)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| execution("row-id column must be uint64"))?;
        let ids: Vec<u64> = ids.iter().flatten().collect();
        Ok(self.delete_row_ids(&ids))
    }

    async fn update(
        &self,
        batch: &RecordBatch,
        row_id_col: usize,
        assignments: &[(usize, usize)],
    ) -> Result<u64> {
        let ids = batch
            .column(row_id_col)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| execution("row-id column must be uint64"))?;
        let ids: Vec<u64> = ids.iter().flatten().collect();
        let removed = self.delete_row_ids(&ids);

        // Rebuild replacement rows in table column order from the value
        // columns named by the assignments.
        let schema = self.schema();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.def.cols.len());
        for (col_idx, _col) in self.def.cols.iter().enumerate() {
            let source = assignments
                .iter()
                .find(|(target, _)| *target == col_idx)
                .map(|(_, value_col)| *value_col)
                .ok_or_else(|| execution("update batch must cover every column"))?;
            arrays.push(batch.column(source).clone());
        }
        let replacement = RecordBatch::try_new(schema, arrays)
            .map_err(|e| execution(format!("update rebuild failed: {e}")))?;
        self.state.write().mem_rows.push(replacement);
        Ok(removed)
    }

    async fn commit_blocks(&self, meta_locs: &[String], fs: &Arc<dyn FileService>) -> Result<u64> {
        let mut rows = 0u64;
        for loc in meta_locs {
            let batch = self.normalize(&fs.read_block(loc).await?)?;
            rows += batch.num_rows() as u64;
            let mut state = self.state.write();
            let seq = state.next_object_seq;
            state.next_object_seq += 1;
            let mut object_name = [0u8; 16];
            object_name[..7].copy_from_slice(format!("{:07}", seq / 4).as_bytes());
            object_name[7..16].copy_from_slice(format!("{:09}", seq).as_bytes());
            state.blocks.push(MemBlock {
                object_name,
                rows: batch,
            });
        }
        Ok(rows)
    }
}

impl MemTable {
    fn delete_block_meta(&self, batch: &RecordBatch) -> Result<u64> {
        // Columns: block id (utf8), serialized row-id batch (utf8 of csv ids
        // is not used here — payload is arrow IPC), skip-flush flag (int8).
        let payloads = batch
            .column(1)
            .as_any()
            .downcast_ref::<arrow::array::BinaryArray>()
            .ok_or_else(|| execution("block-meta payload column must be binary"))?;
        let _flags = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int8Array>()
            .ok_or_else(|| execution("block-meta flag column must be int8"))?;
        let mut removed = 0;
        for i in 0..batch.num_rows() {
            let cursor = std::io::Cursor::new(payloads.value(i).to_vec());
            let reader = arrow::ipc::reader::StreamReader::try_new(cursor, None)
                .map_err(|e| execution(format!("block-meta decode failed: {e}")))?;
            for decoded in reader {
                let decoded = decoded.map_err(|e| execution(format!("block-meta read: {e}")))?;
                let idx = decoded
                    .schema()
                    .index_of(ROW_ID_COL)
                    .map_err(|_| execution("block-meta payload missing row ids"))?;
                let ids = decoded
                    .column(idx)
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .ok_or_else(|| execution("row-id column must be uint64"))?;
                let ids: Vec<u64> = ids.iter().flatten().collect();
                removed += self.delete_row_ids(&ids);
            }
        }
        Ok(removed)
    }

    // Rebind incoming columns (by name, falling back to position) under the
    // table's canonical schema so stored blocks always concatenate.
    fn normalize(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.def.cols.len());
        for (i, col_def) in self.def.cols.iter().enumerate() {
            let idx = batch.schema().index_of(&col_def.name).unwrap_or(i);
            let col = batch
                .columns()
                .get(idx)
                .ok_or_else(|| execution(format!("write missing column '{}'", col_def.name)))?;
            if col_def.not_null && col.null_count() > 0 {
                return Err(TidalError::Constraint(format!(
                    "column '{}' cannot be null",
                    col_def.name
                )));
            }
            columns.push(col.clone());
        }
        RecordBatch::try_new(self.schema(), columns)
            .map_err(|e| execution(format!("schema normalization failed: {e}")))
    }
}

/// In-memory database.
pub struct MemDatabase {
    kind: EngineKind,
    next_table_id: AtomicU64,
    tables: RwLock<HashMap<String, Arc<MemTable>>>,
}

impl MemDatabase {
    fn new(kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            next_table_id: AtomicU64::new(1),
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Direct table handle for test setup.
    pub fn table(&self, name: &str) -> Option<Arc<MemTable>> {
        self.tables.read().get(name).cloned()
    }
}

#[async_trait]
impl Database for MemDatabase {
    async fn relation(&self, name: &str) -> Result<Arc<dyn Relation>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .map(|t| t as Arc<dyn Relation>)
            .ok_or_else(|| execution(format!("no such table '{name}'")))
    }

    async fn create_relation(&self, def: &TableDef) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&def.name) {
            return Err(TidalError::Constraint(format!(
                "table '{}' already exists",
                def.name
            )));
        }
        let id = self.next_table_id.fetch_add(1, Ordering::Relaxed);
        tables.insert(def.name.clone(), MemTable::new(id, self.kind, def.clone()));
        Ok(())
    }

    async fn alter_relation(&self, def: &TableDef) -> Result<()> {
        let tables = self.tables.read();
        let table = tables
            .get(&def.name)
            .ok_or_else(|| execution(format!("no such table '{}'", def.name)))?;
        // Definition swap only; existing blocks keep their layout.
        let replacement = MemTable::new(table.table_id, table.kind, def.clone());
        {
            let mut old_state = table.state.write();
            let mut new_state = replacement.state.write();
            *new_state = std::mem::take(&mut *old_state);
        }
        drop(tables);
        self.tables.write().insert(def.name.clone(), replacement);
        Ok(())
    }

    async fn drop_relation(&self, name: &str) -> Result<()> {
        self.tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| execution(format!("no such table '{name}'")))
    }

    async fn truncate_relation(&self, name: &str) -> Result<u64> {
        let table = self
            .tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| execution(format!("no such table '{name}'")))?;
        let removed = table.visible_row_count() as u64;
        let mut state = table.state.write();
        state.mem_rows.clear();
        state.blocks.clear();
        state.tombstones.clear();
        Ok(removed)
    }
}

/// One configured CN with its label set.
#[derive(Debug, Clone)]
pub struct MemNode {
    /// Node identity and capacity.
    pub node: Node,
    /// Label selector values.
    pub labels: HashMap<String, String>,
}

/// In-memory engine.
pub struct MemEngine {
    kind: EngineKind,
    cluster: Vec<MemNode>,
    hints: Hints,
    dbs: RwLock<HashMap<String, Arc<MemDatabase>>>,
}

impl MemEngine {
    /// Engine with the given cluster, log-structured placement semantics.
    pub fn new(cluster: Vec<MemNode>) -> Arc<Self> {
        Self::with_kind(cluster, EngineKind::LogStructured)
    }

    /// Engine with explicit engine kind.
    pub fn with_kind(cluster: Vec<MemNode>, kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            cluster,
            hints: Hints::default(),
            dbs: RwLock::new(HashMap::new()),
        })
    }

    /// Single-CN engine on `addr` with `mcpu` workers.
    pub fn single(addr: &str, mcpu: usize) -> Arc<Self> {
        Self::new(vec![MemNode {
            node: Node {
                id: 0,
                addr: addr.to_string(),
                mcpu,
                data: Vec::new(),
            },
            labels: HashMap::new(),
        }])
    }

    /// Direct database handle for test setup.
    pub fn db(&self, name: &str) -> Option<Arc<MemDatabase>> {
        self.dbs.read().get(name).cloned()
    }
}

#[async_trait]
impl Engine for MemEngine {
    async fn database(&self, name: &str, _txn: &Arc<dyn TxnOperator>) -> Result<Arc<dyn Database>> {
        self.dbs
            .read()
            .get(name)
            .cloned()
            .map(|d| d as Arc<dyn Database>)
            .ok_or_else(|| execution(format!("no such database '{name}'")))
    }

    fn nodes(
        &self,
        _is_internal: bool,
        _tenant: &str,
        cn_label: &HashMap<String, String>,
    ) -> Result<Vec<Node>> {
        let out: Vec<Node> = self
            .cluster
            .iter()
            .filter(|n| {
                cn_label
                    .iter()
                    .all(|(k, v)| n.labels.get(k).map(|lv| lv == v).unwrap_or(false))
            })
            .map(|n| n.node.clone())
            .collect();
        Ok(out)
    }

    fn hints(&self) -> Hints {
        self.hints
    }

    async fn create_database(&self, name: &str, _txn: &Arc<dyn TxnOperator>) -> Result<()> {
        let mut dbs = self.dbs.write();
        if dbs.contains_key(name) {
            return Err(TidalError::Constraint(format!(
                "database '{name}' already exists"
            )));
        }
        dbs.insert(name.to_string(), MemDatabase::new(self.kind));
        Ok(())
    }

    async fn drop_database(&self, name: &str, _txn: &Arc<dyn TxnOperator>) -> Result<()> {
        self.dbs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| execution(format!("no such database '{name}'")))
    }
}

/// Transaction operator with observable commit/rollback counts.
pub struct MemTxn {
    snapshot: Timestamp,
    commits: AtomicI64,
    rollbacks: AtomicI64,
    clock: Arc<AtomicI64>,
    last_commit: Mutex<Timestamp>,
}

impl MemTxn {
    /// Commits observed on this operator.
    pub fn commit_count(&self) -> i64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Rollbacks observed on this operator.
    pub fn rollback_count(&self) -> i64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TxnOperator for MemTxn {
    fn snapshot_ts(&self) -> Timestamp {
        self.snapshot
    }

    fn commit_ts(&self) -> Timestamp {
        *self.last_commit.lock()
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        let ts = Timestamp {
            physical: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
            logical: 0,
        };
        *self.last_commit.lock() = ts;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Transaction client over a shared logical clock.
pub struct MemTxnClient {
    clock: Arc<AtomicI64>,
    last: Mutex<Vec<Arc<MemTxn>>>,
}

impl MemTxnClient {
    /// Fresh client with its own clock.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: Arc::new(AtomicI64::new(0)),
            last: Mutex::new(Vec::new()),
        })
    }

    /// All operators minted so far, for test assertions.
    pub fn operators(&self) -> Vec<Arc<MemTxn>> {
        self.last.lock().clone()
    }
}

impl TxnClient for MemTxnClient {
    fn new_txn(&self) -> Result<Arc<dyn TxnOperator>> {
        let txn = Arc::new(MemTxn {
            snapshot: Timestamp {
                physical: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
                logical: 0,
            },
            commits: AtomicI64::new(0),
            rollbacks: AtomicI64::new(0),
            clock: Arc::clone(&self.clock),
            last_commit: Mutex::new(Timestamp::default()),
        });
        self.last.lock().push(Arc::clone(&txn));
        Ok(txn)
    }
}

/// In-memory staged-block store.
pub struct MemFileService {
    blocks: RwLock<HashMap<String, RecordBatch>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemFileService {
    /// Empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blocks: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl FileService for MemFileService {
    async fn write_block(&self, meta_loc: &str, batch: RecordBatch) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.write().insert(meta_loc.to_string(), batch);
        Ok(())
    }

    async fn read_block(&self, meta_loc: &str) -> Result<RecordBatch> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .read()
            .get(meta_loc)
            .cloned()
            .ok_or_else(|| execution(format!("no staged block at '{meta_loc}'")))
    }

    fn io_counts(&self) -> (u64, u64) {
        (
            self.writes.load(Ordering::Relaxed),
            self.reads.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use tidal_plan::ColDef;

    fn test_def() -> TableDef {
        TableDef {
            name: "t".to_string(),
            cols: vec![
                ColDef {
                    name: "a".to_string(),
                    data_type: DataType::Int64,
                    not_null: true,
                    primary: true,
                    auto_increment: false,
                },
                ColDef::new("b", DataType::Int64),
            ],
        }
    }

    fn int_batch(schema: SchemaRef, a: Vec<i64>, b: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(a)),
                Arc::new(Int64Array::from(b)),
            ],
        )
        .expect("batch")
    }

    #[tokio::test]
    async fn write_seal_scan_round_trip() {
        let table = MemTable::new(1, EngineKind::LogStructured, test_def());
        let schema = table.schema();
        table
            .write(&int_batch(schema.clone(), vec![1, 2, 3, 4], vec![5, 6, 7, 8]))
            .await
            .expect("write");
        assert_eq!(table.seal_blocks(2).expect("seal"), 2);

        let ranges = table.ranges(&[]).await.expect("ranges");
        // Memory block descriptor plus two sealed blocks.
        assert_eq!(ranges.len(), 3);

        let pool = MemoryPool::unbounded();
        let mut readers = table
            .new_readers(2, None, ranges[1..].to_vec())
            .await
            .expect("readers");
        let mut rows = 0;
        for reader in &mut readers {
            while let Some(batch) = reader
                .read(
                    &["a".to_string(), ROW_ID_COL.to_string()],
                    None,
                    &pool,
                )
                .await
                .expect("read")
            {
                rows += batch.num_rows();
                assert_eq!(batch.num_columns(), 2);
            }
        }
        assert_eq!(rows, 4);
    }

    #[tokio::test]
    async fn not_null_write_is_rejected() {
        let table = MemTable::new(1, EngineKind::Memory, test_def());
        let schema = table.schema();
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])),
                Arc::new(Int64Array::from(vec![Some(2), Some(3)])),
            ],
        )
        .expect("batch");
        let err = table.write(&batch).await.expect_err("not null");
        assert!(matches!(err, TidalError::Constraint(_)));
    }

    #[tokio::test]
    async fn delete_by_row_id_tombstones_rows() {
        let table = MemTable::new(1, EngineKind::Memory, test_def());
        let schema = table.schema();
        table
            .write(&int_batch(schema, vec![1, 2, 3], vec![4, 5, 6]))
            .await
            .expect("write");
        let ids: UInt64Array = vec![MEM_BLOCK_NO << 32, MEM_BLOCK_NO << 32 | 2]
            .into_iter()
            .map(Some)
            .collect();
        let del = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new(
                ROW_ID_COL,
                DataType::UInt64,
                false,
            )])),
            vec![Arc::new(ids)],
        )
        .expect("del batch");
        let removed = table.delete(Some(&del), ROW_ID_COL).await.expect("delete");
        assert_eq!(removed, 2);
        assert_eq!(table.visible_row_count(), 1);
    }
}
