//! Projection: evaluates one expression per output column.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_plan::Expr;

use crate::batch::Batch;
use crate::evaluator::eval;
use crate::process::Process;

/// Projection operator argument.
pub struct ProjectionArg {
    /// Output expressions.
    pub exprs: Vec<Expr>,
}

impl ProjectionArg {
    /// Evaluate every output column.
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
        let mut fields = Vec::with_capacity(self.exprs.len());
        let mut cols = Vec::with_capacity(self.exprs.len());
        for (i, expr) in self.exprs.iter().enumerate() {
            let col = eval(expr, batch.data())?;
            fields.push(Field::new(
                format!("col{i}"),
                col.data_type().clone(),
                true,
            ));
            cols.push(col);
        }
        let projected = RecordBatch::try_new(Arc::new(Schema::new(fields)), cols)
            .map_err(|e| TidalError::Execution(format!("projection failed: {e}")))?;
        drop(batch);
        let out = Batch::new(&proc.pool, projected)?;
        anal.output(&out, is_last);
        anal.stop();
        proc.set_input(Some(out));
        Ok(false)
    }
}
