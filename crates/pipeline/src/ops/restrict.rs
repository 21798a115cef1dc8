//! Row filter.

use arrow::compute::filter_record_batch;
use tidal_common::{Result, TidalError};
use tidal_plan::Expr;

use crate::batch::Batch;
use crate::evaluator::eval_predicate;
use crate::process::Process;

/// Restrict operator argument.
pub struct RestrictArg {
    /// Conjunctive predicate.
    pub filter: Expr,
}

impl RestrictArg {
    /// Keep rows where the predicate is true (NULL drops the row).
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
        let mask = eval_predicate(&self.filter, batch.data())?;
        let filtered = filter_record_batch(batch.data(), &mask)
            .map_err(|e| TidalError::Execution(format!("filter failed: {e}")))?;
        drop(batch);
        let out = Batch::new(&proc.pool, filtered)?;
        anal.output(&out, is_last);
        anal.stop();
        proc.set_input(Some(out));
        Ok(false)
    }
}
