//! Result sink: hands every batch to the caller's fill callback.

use arrow::record_batch::RecordBatch;
use tidal_common::Result;

use crate::process::Process;

/// Callback receiving result batches.
pub type OutputFn = Box<dyn FnMut(&RecordBatch) -> Result<()> + Send + Sync>;

/// Output operator argument.
pub struct OutputArg {
    func: OutputFn,
}

impl OutputArg {
    /// Sink into `func`.
    pub fn new(func: OutputFn) -> Self {
        Self { func }
    }

    /// Deliver the current batch; empty ticks are skipped.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, is_last: bool) -> Result<bool> {
        let Some(batch) = proc.take_input() else {
            return Ok(true);
        };
        if batch.is_empty() {
            return Ok(false);
        }
        proc.analyze(idx).output(&batch, is_last);
        (self.func)(batch.data())?;
        Ok(false)
    }
}
