//! Insert operator: direct engine writes locally, segment-staged blocks on
//! the distributed path.
//!
//! Remote mode buffers its input, splits it into blocks of at most
//! `block_max_rows` rows, stages each block with the file service under a
//! meta-loc derived from a CN segment id, and emits one `(table_idx,
//! meta_loc)` row per staged block for the MergeBlock scope to install.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Int16Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_engine::Relation;

use crate::batch::Batch;
use crate::process::Process;
use crate::row::concat;

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// Field name of the table-index tag on meta-loc batches.
pub const META_TBL_IDX: &str = "tbl_idx";
/// Field name of the meta-loc string on meta-loc batches.
pub const META_LOC: &str = "meta_loc";

/// Schema of the meta-loc stream between Insert and MergeBlock.
pub fn meta_loc_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(META_TBL_IDX, DataType::Int16, false),
        Field::new(META_LOC, DataType::Utf8, false),
    ]))
}

/// Insert operator argument.
pub struct InsertArg {
    /// Target relation.
    pub rel: Arc<dyn Relation>,
    /// Number of unique-index side tables fed on the distributed path.
    pub unique_table_count: usize,
    /// Distributed mode: stage blocks instead of writing directly.
    pub is_remote: bool,
    /// Rows per staged block.
    pub block_max_rows: usize,
    /// Rows written locally, aggregated across parallel instances.
    pub affected: Arc<AtomicU64>,
    staged: Vec<RecordBatch>,
    flushed: bool,
}

impl InsertArg {
    /// Insert into `rel`.
    pub fn new(
        rel: Arc<dyn Relation>,
        unique_table_count: usize,
        is_remote: bool,
        block_max_rows: usize,
        affected: Arc<AtomicU64>,
    ) -> Self {
        Self {
            rel,
            unique_table_count,
            is_remote,
            block_max_rows: block_max_rows.max(1),
            affected,
            staged: Vec::new(),
            flushed: false,
        }
    }

    async fn flush_remote(&mut self, proc: &Process) -> Result<Option<Batch>> {
        if self.staged.is_empty() {
            return Ok(None);
        }
        let fs = proc
            .file_service
            .as_ref()
            .ok_or_else(|| execution("distributed insert needs a file service"))?;
        let segments = proc
            .segments
            .as_ref()
            .ok_or_else(|| execution("distributed insert needs a segment allocator"))?;
        let schema = self.staged[0].schema();
        let staged = std::mem::take(&mut self.staged);
        let all = concat(&schema, &staged)?;

        let segment = segments.generate_segment()?;
        let mut tbl_idx: Vec<i16> = Vec::new();
        let mut meta_locs: Vec<String> = Vec::new();
        let mut offset = 0usize;
        let mut block_no = 0usize;
        while offset < all.num_rows() {
            let rows = self.block_max_rows.min(all.num_rows() - offset);
            let block = all.slice(offset, rows);
            for table in 0..=self.unique_table_count {
                let meta_loc = format!("{segment}:{block_no}:{rows}:{table}");
                fs.write_block(&meta_loc, block.clone()).await?;
                proc.s3.put.fetch_add(1, Ordering::Relaxed);
                tbl_idx.push(table as i16);
                meta_locs.push(meta_loc);
            }
            offset += rows;
            block_no += 1;
        }
        let out = RecordBatch::try_new(
            meta_loc_schema(),
            vec![
                Arc::new(Int16Array::from(tbl_idx)),
                Arc::new(StringArray::from(meta_locs)),
            ],
        )
        .map_err(|e| execution(format!("meta-loc batch failed: {e}")))?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    /// Write or stage the current batch; emit meta-locs at end-of-stream in
    /// remote mode.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        let anal = proc.analyze(idx);
        match proc.take_input() {
            Some(batch) => {
                if batch.is_empty() {
                    return Ok(false);
                }
                anal.input(&batch, is_first);
                if self.is_remote {
                    self.staged.push(batch.data().clone());
                    return Ok(false);
                }
                let started = std::time::Instant::now();
                self.rel.write(batch.data()).await?;
                anal.insert(started.elapsed().as_nanos() as i64);
                self.affected
                    .fetch_add(batch.rows() as u64, Ordering::Relaxed);
                Ok(false)
            }
            None => {
                if !self.is_remote || self.flushed {
                    return Ok(true);
                }
                self.flushed = true;
                let started = std::time::Instant::now();
                let out = self.flush_remote(proc).await?;
                anal.insert(started.elapsed().as_nanos() as i64);
                if let Some(out) = &out {
                    anal.output(out, is_last);
                }
                proc.set_input(out);
                Ok(true)
            }
        }
    }

    /// Drop staged rows.
    pub fn free(&mut self, _failed: bool) {
        self.staged.clear();
    }
}
