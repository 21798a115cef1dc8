//! Bounded top-N, per-scope and merge variants.
//!
//! The staging buffer never exceeds the limit: each incoming batch is folded
//! in with a bounded sort, so memory stays proportional to N regardless of
//! input size. NULL placement resolves per key: explicit flags win, otherwise
//! DESC sorts nulls last and ASC sorts them first.

use arrow::record_batch::RecordBatch;
use tidal_common::Result;
use tidal_plan::OrderSpec;

use crate::batch::Batch;
use crate::process::Process;
use crate::row::{concat, sort_batch};

/// Top operator argument (also backs MergeTop).
pub struct TopArg {
    /// Rows to keep.
    pub limit: i64,
    /// Sort keys.
    pub order: Vec<OrderSpec>,
    staged: Option<RecordBatch>,
    flushed: bool,
}

impl TopArg {
    /// Keep the `limit` first rows under `order`.
    pub fn new(limit: i64, order: Vec<OrderSpec>) -> Self {
        Self {
            limit,
            order,
            staged: None,
            flushed: false,
        }
    }

    /// Fold input into the bounded staging buffer; emit it on end-of-stream.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        anal.start();
        match proc.take_input() {
            Some(batch) => {
                anal.input(&batch, is_first);
                if self.limit > 0 && !batch.is_empty() {
                    let merged = match self.staged.take() {
                        Some(staged) => {
                            concat(&staged.schema(), &[staged.clone(), batch.data().clone()])?
                        }
                        None => batch.data().clone(),
                    };
                    drop(batch);
                    let kept = sort_batch(&merged, &self.order, Some(self.limit as usize))?;
                    anal.alloc(kept.get_array_memory_size() as i64);
                    self.staged = Some(kept);
                }
                anal.stop();
                proc.set_input(Some(Batch::empty_marker()));
                Ok(false)
            }
            None => {
                if self.flushed {
                    anal.stop();
                    return Ok(true);
                }
                self.flushed = true;
                let out = match self.staged.take() {
                    Some(staged) => {
                        let out = Batch::new(&proc.pool, staged)?;
                        anal.output(&out, is_last);
                        Some(out)
                    }
                    None => None,
                };
                anal.stop();
                proc.set_input(out);
                Ok(true)
            }
        }
    }

    /// Drop staged rows.
    pub fn free(&mut self, _failed: bool) {
        self.staged = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use tidal_common::MemoryPool;
    use tidal_engine::Timestamp;
    use tidal_plan::{Expr, NullsOrder};

    fn batch_of(values: Vec<Option<i64>>) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)])),
            vec![Arc::new(Int64Array::from(values))],
        )
        .expect("batch")
    }

    fn order_asc() -> Vec<OrderSpec> {
        vec![OrderSpec {
            expr: Expr::Column(0),
            desc: false,
            nulls: NullsOrder::Default,
        }]
    }

    #[tokio::test]
    async fn keeps_smallest_n_across_batches() {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let mut top = TopArg::new(2, order_asc());

        for values in [vec![Some(5), Some(1)], vec![Some(3), Some(0)]] {
            let b = Batch::new(&proc.pool, batch_of(values)).expect("batch");
            proc.set_input(Some(b));
            assert!(!top.call(&mut proc, 0, true, true).await.expect("call"));
        }
        proc.set_input(None);
        assert!(top.call(&mut proc, 0, true, true).await.expect("flush"));
        let out = proc.take_input().expect("result");
        let col = out
            .data()
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        assert_eq!(col.values(), &[0, 1]);
    }

    #[tokio::test]
    async fn desc_puts_nulls_last_by_default() {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let mut top = TopArg::new(3, vec![OrderSpec {
            expr: Expr::Column(0),
            desc: true,
            nulls: NullsOrder::Default,
        }]);
        let b = Batch::new(&proc.pool, batch_of(vec![None, Some(2), Some(9)])).expect("batch");
        proc.set_input(Some(b));
        top.call(&mut proc, 0, true, true).await.expect("call");
        proc.set_input(None);
        top.call(&mut proc, 0, true, true).await.expect("flush");
        let out = proc.take_input().expect("result");
        let col = out
            .data()
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        assert_eq!(col.value(0), 9);
        assert_eq!(col.value(1), 2);
        assert!(col.is_null(2));
    }
}
