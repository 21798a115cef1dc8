//! Terminal of the distributed-insert pipeline: installs staged blocks into
//! the target relation and its unique-index side tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, Int16Array, StringArray};
use tidal_common::{Result, TidalError};
use tidal_engine::Relation;

use crate::process::Process;

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// MergeBlock operator argument.
pub struct MergeBlockArg {
    /// Target relation (table index 0 on the meta stream).
    pub tbl: Arc<dyn Relation>,
    /// Unique-index side tables (table index i+1).
    pub unique_tbls: Vec<Arc<dyn Relation>>,
    /// Rows installed into the target relation.
    pub affected: Arc<AtomicU64>,
}

impl MergeBlockArg {
    /// Merge-block into `tbl` and `unique_tbls`.
    pub fn new(
        tbl: Arc<dyn Relation>,
        unique_tbls: Vec<Arc<dyn Relation>>,
        affected: Arc<AtomicU64>,
    ) -> Self {
        Self {
            tbl,
            unique_tbls,
            affected,
        }
    }

    /// Install the meta-locs of one batch.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        let Some(batch) = proc.take_input() else {
            return Ok(true);
        };
        if batch.is_empty() {
            return Ok(false);
        }
        anal.input(&batch, is_first);
        let fs = proc
            .file_service
            .as_ref()
            .ok_or_else(|| execution("merge-block needs a file service"))?
            .clone();
        let tbl_idx = batch
            .data()
            .column(0)
            .as_any()
            .downcast_ref::<Int16Array>()
            .ok_or_else(|| execution("meta batch column 0 must be int16"))?;
        let meta_locs = batch
            .data()
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| execution("meta batch column 1 must be utf8"))?;

        let mut per_table: Vec<Vec<String>> = vec![Vec::new(); self.unique_tbls.len() + 1];
        for row in 0..batch.rows() {
            let idx = tbl_idx.value(row) as usize;
            let slot = per_table
                .get_mut(idx)
                .ok_or_else(|| execution(format!("meta batch table index {idx} out of range")))?;
            slot.push(meta_locs.value(row).to_string());
        }
        anal.start();
        for (table, locs) in per_table.into_iter().enumerate() {
            if locs.is_empty() {
                continue;
            }
            let rel = if table == 0 {
                &self.tbl
            } else {
                &self.unique_tbls[table - 1]
            };
            let rows = rel.commit_blocks(&locs, &fs).await?;
            if table == 0 {
                self.affected.fetch_add(rows, Ordering::Relaxed);
            }
        }
        anal.stop();
        Ok(false)
    }
}
