//! Insert preprocessing: not-null enforcement, auto-increment fill,
//! composite-key derivation, and cluster-table duplication.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_plan::InsertCtx;

use crate::batch::Batch;
use crate::process::Process;
use crate::row::{key_at, ScalarKey};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// PreInsert operator argument.
pub struct PreInsertArg {
    /// Insert context of the target table.
    pub ctx: InsertCtx,
    auto_increment: Arc<AtomicI64>,
}

impl PreInsertArg {
    /// Preprocessor for `ctx`; `auto_increment` is shared across the parallel
    /// instances of one statement so generated values never collide.
    pub fn new(ctx: InsertCtx, auto_increment: Arc<AtomicI64>) -> Self {
        Self {
            ctx,
            auto_increment,
        }
    }

    fn fill_auto_increment(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        if self.ctx.auto_increment_cols.is_empty() {
            return Ok(batch.clone());
        }
        let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
        for col_idx in &self.ctx.auto_increment_cols {
            let col = columns
                .get(*col_idx)
                .ok_or_else(|| execution(format!("auto-increment column {col_idx} missing")))?;
            if col.null_count() == 0 {
                continue;
            }
            let values = col
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| execution("auto-increment column must be int64"))?;
            let filled: Int64Array = values
                .iter()
                .map(|v| {
                    Some(v.unwrap_or_else(|| self.auto_increment.fetch_add(1, Ordering::Relaxed) + 1))
                })
                .collect();
            columns[*col_idx] = Arc::new(filled);
        }
        RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| execution(format!("auto-increment fill failed: {e}")))
    }

    fn check_not_null(&self, batch: &RecordBatch) -> Result<()> {
        for (i, col_def) in self.ctx.table_def.cols.iter().enumerate() {
            if !col_def.not_null {
                continue;
            }
            let Some(col) = batch.columns().get(i) else {
                continue;
            };
            if col.null_count() > 0 {
                return Err(TidalError::Constraint(format!(
                    "column '{}' cannot be null",
                    col_def.name
                )));
            }
        }
        Ok(())
    }

    // Append the derived composite primary-key column.
    fn fill_composite_key(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        if self.ctx.composite_pk_cols.is_empty() {
            return Ok(batch.clone());
        }
        let mut keys = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let mut parts = Vec::with_capacity(self.ctx.composite_pk_cols.len());
            for col_idx in &self.ctx.composite_pk_cols {
                let col = batch
                    .columns()
                    .get(*col_idx)
                    .ok_or_else(|| execution(format!("composite key column {col_idx} missing")))?;
                let part = match key_at(col, row)? {
                    ScalarKey::Null => {
                        return Err(TidalError::Constraint(
                            "composite primary key cannot contain null".to_string(),
                        ))
                    }
                    ScalarKey::Int(v) => v.to_string(),
                    ScalarKey::UInt(v) => v.to_string(),
                    ScalarKey::FloatBits(b) => f64::from_bits(b).to_string(),
                    ScalarKey::Str(s) => s,
                    ScalarKey::Bool(b) => b.to_string(),
                };
                parts.push(part);
            }
            keys.push(parts.join("-"));
        }
        let mut fields: Vec<Field> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new("__tidal_cpkey", DataType::Utf8, false));
        let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
        columns.push(Arc::new(StringArray::from(keys)));
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("composite key failed: {e}")))
    }

    // Duplicate rows once per target tenant, overwriting the account column
    // while keeping generated auto-increment values intact.
    fn expand_cluster_table(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let Some(cluster) = &self.ctx.cluster_table else {
            return Ok(batch.clone());
        };
        let mut copies = Vec::with_capacity(cluster.account_ids.len());
        for account in &cluster.account_ids {
            let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
            let account_col: UInt64Array = (0..batch.num_rows())
                .map(|_| Some(*account as u64))
                .collect();
            if cluster.account_col >= columns.len() {
                return Err(execution("cluster account column out of range"));
            }
            columns[cluster.account_col] = Arc::new(account_col);
            copies.push(
                RecordBatch::try_new(batch.schema(), columns)
                    .map_err(|e| execution(format!("cluster duplication failed: {e}")))?,
            );
        }
        crate::row::concat(&batch.schema(), &copies)
    }

    /// Transform the current batch for insertion.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        let Some(batch) = proc.take_input() else {
            return Ok(false);
        };
        if batch.is_empty() {
            proc.set_input(Some(batch));
            return Ok(false);
        }
        let mut anal = proc.analyze(idx);
        anal.start();
        anal.input(&batch, is_first);
        let data = self.fill_auto_increment(batch.data())?;
        drop(batch);
        self.check_not_null(&data)?;
        let data = self.fill_composite_key(&data)?;
        let data = self.expand_cluster_table(&data)?;
        let out = Batch::new(&proc.pool, data)?;
        anal.output(&out, is_last);
        anal.stop();
        proc.set_input(Some(out));
        Ok(false)
    }
}
