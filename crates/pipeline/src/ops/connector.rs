//! Point-to-point forwarding into one wait register.

use tidal_common::Result;

use crate::process::Process;
use crate::register::RegSender;

/// Connector operator argument.
pub struct ConnectorArg {
    /// Destination register.
    pub reg: RegSender,
    end_sent: bool,
}

impl ConnectorArg {
    /// Connector into `reg`.
    pub fn new(reg: RegSender) -> Self {
        Self {
            reg,
            end_sent: false,
        }
    }

    /// Forward the current batch. A gone consumer ends this producer
    /// gracefully rather than erroring — cancellation owns teardown.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, is_last: bool) -> Result<bool> {
        let Some(batch) = proc.take_input() else {
            return Ok(false);
        };
        let anal = proc.analyze(idx);
        anal.output(&batch, is_last);
        if !self.reg.send(Some(batch)).await {
            return Ok(true);
        }
        Ok(false)
    }

    /// Send the single terminal nil; runs on success and failure paths.
    pub async fn free(&mut self, _proc: &mut Process, _failed: bool) {
        if !self.end_sent {
            self.end_sent = true;
            let _ = self.reg.send(None).await;
        }
    }
}
