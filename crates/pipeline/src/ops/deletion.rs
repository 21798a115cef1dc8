//! Deletion operator: direct row-id deletes locally, block-grouped row-id
//! staging on the distributed path.
//!
//! Remote mode relies on the block-hash dispatch upstream: rows reaching one
//! instance all belong to blocks assigned to its bucket, so a given block is
//! deleted by exactly one CN. The bucket filter here is a guard against
//! misrouted rows, not the routing mechanism.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, BinaryArray, Int8Array, StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_engine::{Database, Relation, ROW_ID_COL};
use tidal_plan::{DeleteCtx, FkMode};

use crate::batch::Batch;
use crate::ipc::serialize_batch;
use crate::process::Process;
use crate::row::{hash_key, ScalarKey};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

fn row_id_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![Field::new(
        ROW_ID_COL,
        DataType::UInt64,
        false,
    )]))
}

fn row_id_batch(ids: Vec<u64>) -> Result<RecordBatch> {
    RecordBatch::try_new(
        row_id_schema(),
        vec![Arc::new(ids.into_iter().map(Some).collect::<UInt64Array>())],
    )
    .map_err(|e| execution(format!("row-id batch failed: {e}")))
}

fn extract_row_ids(batch: &RecordBatch, col: usize) -> Result<Vec<u64>> {
    let ids = batch
        .columns()
        .get(col)
        .ok_or_else(|| execution(format!("row-id column {col} missing")))?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| execution("row-id column must be uint64"))?;
    Ok(ids.iter().flatten().collect())
}

/// Deletion operator argument.
pub struct DeletionArg {
    /// Delete context.
    pub ctx: DeleteCtx,
    /// Target relation.
    pub rel: Arc<dyn Relation>,
    /// Cascade child relations, parallel to `ctx.on_cascade`.
    pub cascade_rels: Vec<Arc<dyn Relation>>,
    /// Secondary-index relations, parallel to `ctx.index_deletes`.
    pub index_rels: Vec<Arc<dyn Relation>>,
    /// Distributed mode: stage per-block row-id batches instead of deleting.
    pub remote: bool,
    /// Bucket slot this instance owns.
    pub ibucket: u64,
    /// Bucket count.
    pub nbucket: u64,
    /// Rows deleted locally, aggregated across instances.
    pub affected: Arc<AtomicU64>,
    /// Database handle for whole-table deletes rewritten to truncate.
    pub truncate_db: Option<Arc<dyn Database>>,
    staged: HashMap<u64, Vec<u64>>,
    flushed: bool,
}

impl DeletionArg {
    /// Deletion into `rel` under `ctx`.
    pub fn new(
        ctx: DeleteCtx,
        rel: Arc<dyn Relation>,
        cascade_rels: Vec<Arc<dyn Relation>>,
        index_rels: Vec<Arc<dyn Relation>>,
        affected: Arc<AtomicU64>,
    ) -> Self {
        Self {
            ctx,
            rel,
            cascade_rels,
            index_rels,
            remote: false,
            ibucket: 0,
            nbucket: 1,
            affected,
            truncate_db: None,
            staged: HashMap::new(),
            flushed: false,
        }
    }

    /// Enable the truncate rewrite for whole-table deletes.
    pub fn with_truncate(mut self, db: Arc<dyn Database>) -> Self {
        self.truncate_db = Some(db);
        self
    }

    /// Switch to the distributed path with a bucket assignment.
    pub fn with_remote(mut self, ibucket: u64, nbucket: u64) -> Self {
        self.remote = true;
        self.ibucket = ibucket;
        self.nbucket = nbucket.max(1);
        self
    }

    async fn delete_local(&self, batch: &RecordBatch) -> Result<u64> {
        if self.ctx.fk_mode == FkMode::Inline {
            for col_idx in &self.ctx.on_restrict_cols {
                let col = batch
                    .columns()
                    .get(*col_idx)
                    .ok_or_else(|| execution(format!("restrict column {col_idx} missing")))?;
                if col.null_count() != col.len() {
                    return Err(TidalError::Constraint(
                        "Cannot delete or update a parent row: a foreign key constraint fails"
                            .to_string(),
                    ));
                }
            }
            for (cascade, rel) in self.ctx.on_cascade.iter().zip(&self.cascade_rels) {
                let ids = extract_row_ids(batch, cascade.row_id_col)?;
                if !ids.is_empty() {
                    rel.delete(Some(&row_id_batch(ids)?), ROW_ID_COL).await?;
                }
            }
        }
        for (index, rel) in self.ctx.index_deletes.iter().zip(&self.index_rels) {
            let ids = extract_row_ids(batch, index.row_id_col)?;
            if !ids.is_empty() {
                rel.delete(Some(&row_id_batch(ids)?), ROW_ID_COL).await?;
            }
        }
        let ids = extract_row_ids(batch, self.ctx.row_id_col)?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.rel.delete(Some(&row_id_batch(ids)?), ROW_ID_COL).await
    }

    fn stage_remote(&mut self, batch: &RecordBatch) -> Result<()> {
        let ids = extract_row_ids(batch, self.ctx.row_id_col)?;
        for id in ids {
            let block = id >> 32;
            // Guard: only stage blocks hashed to this bucket.
            if self.nbucket > 1 {
                let h = hash_key(&[ScalarKey::UInt(block)]);
                if h % self.nbucket != self.ibucket {
                    continue;
                }
            }
            self.staged.entry(block).or_default().push(id);
        }
        Ok(())
    }

    fn flush_remote(&mut self, proc: &Process) -> Result<Option<Batch>> {
        if self.staged.is_empty() {
            return Ok(None);
        }
        let mut entries: Vec<(String, Vec<u8>, i8)> = Vec::with_capacity(self.staged.len());
        let mut blocks: Vec<_> = std::mem::take(&mut self.staged).into_iter().collect();
        blocks.sort_by_key(|(block, _)| *block);
        for (block, ids) in blocks {
            let payload = serialize_batch(&row_id_batch(ids)?)?;
            entries.push((format!("blk-{block}"), payload, 0));
        }
        let out = block_meta_batch(&entries)?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    /// Delete or stage the current batch; emit block metadata at
    /// end-of-stream in remote mode.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        match proc.take_input() {
            Some(batch) => {
                if batch.is_empty() {
                    return Ok(false);
                }
                anal.input(&batch, is_first);
                if self.remote {
                    self.stage_remote(batch.data())?;
                    return Ok(false);
                }
                anal.start();
                let removed = self.delete_local(batch.data()).await?;
                anal.stop();
                self.affected.fetch_add(removed, Ordering::Relaxed);
                Ok(false)
            }
            None => {
                if self.flushed {
                    return Ok(true);
                }
                self.flushed = true;
                if !self.remote {
                    // Whole-table deletes skip row traffic entirely and
                    // truncate at end-of-stream.
                    if self.ctx.can_truncate {
                        if let Some(db) = &self.truncate_db {
                            let removed = db.truncate_relation(&self.ctx.table_name).await?;
                            self.affected.fetch_add(removed, Ordering::Relaxed);
                        }
                    }
                    return Ok(true);
                }
                let out = self.flush_remote(proc)?;
                if let Some(out) = &out {
                    anal.output(out, is_last);
                }
                proc.set_input(out);
                Ok(true)
            }
        }
    }

    /// Drop staged row ids.
    pub fn free(&mut self, _failed: bool) {
        self.staged.clear();
    }
}

/// Build the per-block metadata batch carried on the MergeDelete stream:
/// block id, IPC-serialized row-id payload, and the skip-flush flag.
pub fn block_meta_batch(entries: &[(String, Vec<u8>, i8)]) -> Result<RecordBatch> {
    let ids: StringArray = entries.iter().map(|(id, _, _)| Some(id.as_str())).collect();
    let payloads: BinaryArray = entries
        .iter()
        .map(|(_, payload, _)| Some(payload.as_slice()))
        .collect();
    let flags: Int8Array = entries.iter().map(|(_, _, f)| Some(*f)).collect();
    let schema = Arc::new(Schema::new(vec![
        Field::new("block_id", DataType::Utf8, false),
        Field::new("row_ids", DataType::Binary, false),
        Field::new("skip_flush", DataType::Int8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![Arc::new(ids), Arc::new(payloads), Arc::new(flags)],
    )
    .map_err(|e| execution(format!("block-meta batch failed: {e}")))
}
