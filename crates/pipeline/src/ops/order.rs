//! Full sort, per-scope and merge variants.

use arrow::record_batch::RecordBatch;
use tidal_common::Result;
use tidal_plan::OrderSpec;

use crate::batch::Batch;
use crate::process::Process;
use crate::row::{concat, sort_batch};

/// Order operator argument (also backs MergeOrder).
pub struct OrderArg {
    /// Sort keys.
    pub order: Vec<OrderSpec>,
    staged: Vec<RecordBatch>,
    flushed: bool,
}

impl OrderArg {
    /// Sort under `order`.
    pub fn new(order: Vec<OrderSpec>) -> Self {
        Self {
            order,
            staged: Vec::new(),
            flushed: false,
        }
    }

    /// Buffer input; emit the sorted whole on end-of-stream.
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
                if !batch.is_empty() {
                    anal.alloc(batch.size_bytes() as i64);
                    self.staged.push(batch.data().clone());
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
                let out = if self.staged.is_empty() {
                    None
                } else {
                    let schema = self.staged[0].schema();
                    let staged = std::mem::take(&mut self.staged);
                    let all = concat(&schema, &staged)?;
                    let sorted = sort_batch(&all, &self.order, None)?;
                    let out = Batch::new(&proc.pool, sorted)?;
                    anal.output(&out, is_last);
                    Some(out)
                };
                anal.stop();
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
