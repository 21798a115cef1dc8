//! Update operator: in-place row rewrites keyed by row id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidal_common::Result;
use tidal_engine::Relation;
use tidal_plan::UpdateCtx;

use crate::process::Process;

/// Update operator argument.
pub struct UpdateArg {
    /// Update context.
    pub ctx: UpdateCtx,
    /// Target relation.
    pub rel: Arc<dyn Relation>,
    /// Rows updated.
    pub affected: Arc<AtomicU64>,
}

impl UpdateArg {
    /// Update into `rel` under `ctx`.
    pub fn new(ctx: UpdateCtx, rel: Arc<dyn Relation>, affected: Arc<AtomicU64>) -> Self {
        Self { ctx, rel, affected }
    }

    /// Apply one batch of row rewrites.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        let Some(batch) = proc.take_input() else {
            return Ok(true);
        };
        if batch.is_empty() {
            return Ok(false);
        }
        anal.input(&batch, is_first);
        anal.start();
        let updated = self
            .rel
            .update(batch.data(), self.ctx.row_id_col, &self.ctx.assignments)
            .await?;
        anal.stop();
        self.affected.fetch_add(updated, Ordering::Relaxed);
        Ok(false)
    }
}
