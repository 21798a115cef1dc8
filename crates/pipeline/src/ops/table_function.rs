//! Table functions over a child stream.

use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_plan::{TableFnDef, Value};

use crate::batch::Batch;
use crate::process::Process;

/// Table-function operator argument.
pub struct TableFunctionArg {
    /// Function definition.
    pub def: TableFnDef,
    emitted: bool,
}

impl TableFunctionArg {
    /// Operator for `def`.
    pub fn new(def: TableFnDef) -> Self {
        Self {
            def,
            emitted: false,
        }
    }

    fn arg_i64(&self, pos: usize) -> Result<i64> {
        match self.def.args.get(pos) {
            Some(Value::Int64(v)) => Ok(*v),
            other => Err(TidalError::Plan(format!(
                "table function '{}' argument {pos} must be int, got {other:?}",
                self.def.name
            ))),
        }
    }

    fn generate(&self) -> Result<RecordBatch> {
        match self.def.name.as_str() {
            "generate_series" => {
                let start = self.arg_i64(0)?;
                let stop = self.arg_i64(1)?;
                let step = if self.def.args.len() > 2 {
                    self.arg_i64(2)?
                } else {
                    1
                };
                if step == 0 {
                    return Err(TidalError::Plan(
                        "generate_series step must be non-zero".to_string(),
                    ));
                }
                let mut values = Vec::new();
                let mut v = start;
                while (step > 0 && v <= stop) || (step < 0 && v >= stop) {
                    values.push(v);
                    v += step;
                }
                RecordBatch::try_new(
                    Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)])),
                    vec![Arc::new(Int64Array::from(values))],
                )
                .map_err(|e| TidalError::Execution(format!("series batch failed: {e}")))
            }
            other => Err(TidalError::Nyi(format!("table function '{other}'"))),
        }
    }

    /// Emit the function's rowset on the first live tick.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, is_last: bool) -> Result<bool> {
        let Some(input) = proc.take_input() else {
            return Ok(false);
        };
        drop(input);
        if self.emitted {
            return Ok(false);
        }
        self.emitted = true;
        let batch = Batch::new(&proc.pool, self.generate()?)?;
        proc.analyze(idx).output(&batch, is_last);
        proc.set_input(Some(batch));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_common::MemoryPool;
    use tidal_engine::Timestamp;

    #[tokio::test]
    async fn generate_series_emits_range() {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let mut arg = TableFunctionArg::new(TableFnDef {
            name: "generate_series".to_string(),
            args: vec![Value::Int64(1), Value::Int64(5), Value::Int64(2)],
        });
        let trigger = RecordBatch::new_empty(Arc::new(Schema::new(vec![Field::new(
            "x",
            DataType::Int64,
            true,
        )])));
        proc.set_input(Some(Batch::unpooled(trigger)));
        arg.call(&mut proc, 0, true).await.expect("call");
        let out = proc.take_input().expect("series");
        assert_eq!(out.rows(), 3);
    }
}
