//! The instruction-chain driver loop.

use tidal_common::{Result, TidalError};

use crate::operator::Instruction;
use crate::process::Process;
use crate::scope::Source;

/// Prepare and drive a chain of instructions to completion, then run every
/// `free` hook exactly once with the failure flag.
pub async fn run_pipeline(
    proc: &mut Process,
    instructions: &mut [Instruction],
    source: Option<Source>,
) -> Result<()> {
    let result = drive(proc, instructions, source).await;
    let failed = result.is_err();
    if failed {
        // Drop queued batches back into the pool and release blocked
        // producers before freeing.
        proc.drain_receivers();
    }
    for ins in instructions.iter_mut() {
        ins.free(proc, failed).await;
    }
    proc.set_input(None);
    result
}

async fn drive(
    proc: &mut Process,
    instructions: &mut [Instruction],
    mut source: Option<Source>,
) -> Result<()> {
    for ins in instructions.iter_mut() {
        ins.prepare(proc)?;
    }
    // A scope is fed either by its source or by a channel/source-style head
    // operator; anything else gets exactly one flush tick.
    let head_feeds = source.is_some()
        || instructions
            .first()
            .map(|i| i.feeds_pipeline())
            .unwrap_or(false);

    loop {
        if proc.cancel.is_cancelled() {
            return Err(TidalError::Cancelled);
        }
        let eos_tick = match &mut source {
            Some(src) => {
                let item = src.next(proc).await?;
                let eos = item.is_none();
                proc.set_input(item);
                eos
            }
            None => {
                proc.set_input(None);
                !head_feeds
            }
        };

        let mut ended_at: Option<usize> = None;
        for (i, ins) in instructions.iter_mut().enumerate() {
            if ins.call(proc).await? {
                ended_at = Some(i);
            }
        }
        // Any unconsumed tail output returns to the pool here.
        proc.set_input(None);

        if let Some(i) = ended_at {
            // Drain downstream of the ended operator with one nil tick so
            // every remaining operator can flush.
            if i + 1 < instructions.len() {
                proc.set_input(None);
                for ins in instructions[i + 1..].iter_mut() {
                    ins.call(proc).await?;
                }
                proc.set_input(None);
            }
            return Ok(());
        }
        if eos_tick {
            return Ok(());
        }
    }
}
