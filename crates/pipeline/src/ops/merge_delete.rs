//! Terminal of the distributed-delete pipeline: feeds per-block metadata
//! into the delete source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidal_common::Result;
use tidal_engine::{Relation, BLOCK_META_ID};

use crate::process::Process;

/// MergeDelete operator argument.
pub struct MergeDeleteArg {
    /// The relation block metadata is applied to.
    pub del_source: Arc<dyn Relation>,
    /// Rows removed, summed across the meta stream.
    pub affected: Arc<AtomicU64>,
}

impl MergeDeleteArg {
    /// Merge-delete into `del_source`.
    pub fn new(del_source: Arc<dyn Relation>, affected: Arc<AtomicU64>) -> Self {
        Self {
            del_source,
            affected,
        }
    }

    /// Apply one block-meta batch; finalize the stream on end.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        match proc.take_input() {
            Some(batch) => {
                if batch.is_empty() {
                    return Ok(false);
                }
                anal.input(&batch, is_first);
                anal.start();
                let removed = self
                    .del_source
                    .delete(Some(batch.data()), BLOCK_META_ID)
                    .await?;
                anal.stop();
                self.affected.fetch_add(removed, Ordering::Relaxed);
                Ok(false)
            }
            None => {
                // Deletes are over; give the source its finalize call (the
                // compaction hook on real engines).
                self.del_source.delete(None, BLOCK_META_ID).await?;
                Ok(true)
            }
        }
    }
}
