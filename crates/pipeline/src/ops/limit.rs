//! Limit and offset operators, per-scope and merge variants.
//!
//! The merge variants share the kernels; they differ only in where the
//! compiler places them (after a merge head, seeing the combined stream).

use tidal_common::Result;

use crate::batch::Batch;
use crate::process::Process;

/// Limit operator argument.
pub struct LimitArg {
    /// Maximum rows to emit.
    pub limit: i64,
    seen: i64,
}

impl LimitArg {
    /// Limit to `limit` rows.
    pub fn new(limit: i64) -> Self {
        Self { limit, seen: 0 }
    }

    /// Trim the current batch; `end` once the quota is filled.
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
        let anal = proc.analyze(idx);
        anal.input(&batch, is_first);
        if self.seen >= self.limit {
            proc.set_input(None);
            return Ok(true);
        }
        let remaining = (self.limit - self.seen) as usize;
        let out = if batch.rows() > remaining {
            let sliced = batch.data().slice(0, remaining);
            drop(batch);
            Batch::new(&proc.pool, sliced)?
        } else {
            batch
        };
        self.seen += out.rows() as i64;
        let end = self.seen >= self.limit;
        anal.output(&out, is_last);
        proc.set_input(Some(out));
        Ok(end)
    }
}

/// Offset operator argument.
pub struct OffsetArg {
    /// Rows to drop before emitting.
    pub offset: i64,
    skipped: i64,
}

impl OffsetArg {
    /// Skip `offset` rows.
    pub fn new(offset: i64) -> Self {
        Self { offset, skipped: 0 }
    }

    /// Drop leading rows until the offset is consumed.
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
        let anal = proc.analyze(idx);
        anal.input(&batch, is_first);
        let remaining_skip = self.offset - self.skipped;
        let out = if remaining_skip <= 0 {
            batch
        } else if (batch.rows() as i64) <= remaining_skip {
            self.skipped += batch.rows() as i64;
            let empty = batch.data().slice(0, 0);
            drop(batch);
            Batch::new(&proc.pool, empty)?
        } else {
            self.skipped = self.offset;
            let sliced = batch
                .data()
                .slice(remaining_skip as usize, batch.rows() - remaining_skip as usize);
            drop(batch);
            Batch::new(&proc.pool, sliced)?
        };
        anal.output(&out, is_last);
        proc.set_input(Some(out));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use tidal_common::MemoryPool;
    use tidal_engine::Timestamp;

    fn proc_with_batch(values: Vec<i64>) -> Process {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(values))],
        )
        .expect("batch");
        let batch = Batch::new(&proc.pool, batch).expect("batch");
        proc.set_input(Some(batch));
        proc
    }

    #[tokio::test]
    async fn limit_trims_and_ends() {
        let mut proc = proc_with_batch(vec![1, 2, 3, 4, 5]);
        let mut limit = LimitArg::new(3);
        let end = limit.call(&mut proc, 0, true, true).await.expect("call");
        assert!(end);
        assert_eq!(proc.take_input().expect("out").rows(), 3);
    }

    #[tokio::test]
    async fn offset_skips_across_batches() {
        let mut offset = OffsetArg::new(4);
        let mut proc = proc_with_batch(vec![1, 2, 3]);
        offset.call(&mut proc, 0, true, true).await.expect("call");
        assert_eq!(proc.take_input().expect("out").rows(), 0);

        let mut proc = proc_with_batch(vec![4, 5, 6]);
        offset.call(&mut proc, 0, true, true).await.expect("call");
        assert_eq!(proc.take_input().expect("out").rows(), 2);
    }
}
