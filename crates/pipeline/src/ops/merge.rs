//! Fan-in: reads from every merge receiver and forwards batches downstream.

use futures::future::select_all;
use tidal_common::{Result, TidalError};

use crate::process::Process;
use crate::register::{Received, RegReceiver};

/// Merge operator argument.
#[derive(Default)]
pub struct MergeArg {
    receivers: Vec<RegReceiver>,
}

impl MergeArg {
    /// Take ownership of the scope's receivers.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        self.receivers = proc
            .merge_receivers
            .iter_mut()
            .map(|r| r.take_receiver())
            .collect();
        Ok(())
    }

    /// Forward the next available batch; `end` once every receiver closed.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, _is_first: bool) -> Result<bool> {
        let anal = proc.analyze(idx);
        loop {
            if self.receivers.is_empty() {
                proc.set_input(None);
                return Ok(true);
            }
            let started = std::time::Instant::now();
            let futures: Vec<_> = self
                .receivers
                .iter_mut()
                .map(|r| Box::pin(r.recv(None)))
                .collect();
            let (received, winner, _) = select_all(futures).await;
            anal.wait(started.elapsed().as_nanos() as i64);
            match received {
                Received::Batch(batch) => {
                    proc.set_input(Some(batch));
                    return Ok(false);
                }
                Received::End => {
                    self.receivers.swap_remove(winner);
                }
                Received::Cancelled => return Err(TidalError::Cancelled),
            }
        }
    }

    /// Drop remaining receivers; queued batches return to the pool.
    pub fn free(&mut self, _failed: bool) {
        for r in &mut self.receivers {
            r.drain();
        }
        self.receivers.clear();
    }
}
