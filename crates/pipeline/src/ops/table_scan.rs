//! Analyze-counting head of table-scan pipelines.
//!
//! The scope's data source feeds the input slot; this operator attributes the
//! rows to the scan's plan node and passes them through unchanged.

use tidal_common::Result;

use crate::process::Process;

/// Table-scan operator argument.
#[derive(Default)]
pub struct TableScanArg;

impl TableScanArg {
    /// Count and forward.
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
        anal.output(&batch, is_last);
        proc.set_input(Some(batch));
        Ok(false)
    }
}
