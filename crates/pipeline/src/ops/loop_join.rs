//! Nested-loop joins and cross product.
//!
//! Same two-receiver layout as the hash joins; the condition is an arbitrary
//! expression evaluated over probe-row × build-rows candidate pairs, with
//! probe columns first and build columns after.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use tidal_common::{Result, TidalError};
use tidal_plan::Expr;

use crate::batch::Batch;
use crate::evaluator::eval_predicate;
use crate::process::Process;
use crate::register::{Received, RegReceiver};
use crate::row::concat;

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// Nested-loop join variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopJoinKind {
    /// Inner nested-loop join.
    Inner,
    /// Left outer nested-loop join.
    Left,
    /// Scalar-subquery nested-loop join.
    Single,
    /// Semi nested-loop join.
    Semi,
    /// Anti nested-loop join.
    Anti,
    /// Mark join: probe columns plus a three-valued match marker.
    Mark,
}

/// Nested-loop operator argument (also backs Product with no condition).
pub struct LoopJoinArg {
    /// Join variant.
    pub kind: LoopJoinKind,
    /// Join condition over probe ++ build columns; `None` keeps every pair.
    pub cond: Option<Expr>,
    /// Build-side column types for empty-build schemas.
    pub build_types: Vec<DataType>,
    probe_rx: Option<RegReceiver>,
    build_rx: Option<RegReceiver>,
    build: Option<RecordBatch>,
}

impl LoopJoinArg {
    /// Nested-loop join of `kind` under `cond`.
    pub fn new(kind: LoopJoinKind, cond: Option<Expr>, build_types: Vec<DataType>) -> Self {
        Self {
            kind,
            cond,
            build_types,
            probe_rx: None,
            build_rx: None,
            build: None,
        }
    }

    /// Take the probe (slot 0) and build (slot 1) receivers.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        if proc.merge_receivers.len() < 2 {
            return Err(execution("loop-join scope needs probe and build receivers"));
        }
        self.probe_rx = Some(proc.merge_receivers[0].take_receiver());
        self.build_rx = Some(proc.merge_receivers[1].take_receiver());
        Ok(())
    }

    fn build_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.build_types
                .iter()
                .enumerate()
                .map(|(i, t)| Field::new(format!("b{i}"), t.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    async fn finish_build(&mut self) -> Result<()> {
        let rx = self.build_rx.as_mut().expect("prepared");
        let mut staged = Vec::new();
        loop {
            match rx.recv(None).await {
                Received::Batch(batch) => {
                    if !batch.is_empty() {
                        staged.push(batch.data().clone());
                    }
                }
                Received::End => break,
                Received::Cancelled => return Err(TidalError::Cancelled),
            }
        }
        let schema = staged
            .first()
            .map(|b| b.schema())
            .unwrap_or_else(|| self.build_schema());
        self.build = Some(concat(&schema, &staged)?);
        Ok(())
    }

    // Evaluate the condition for one probe row against every build row,
    // returning (matched build indices, saw-null-verdict).
    fn matches_for_row(&self, probe: &RecordBatch, row: usize) -> Result<(Vec<u32>, bool)> {
        let build = self.build.as_ref().expect("built");
        if build.num_rows() == 0 {
            return Ok((Vec::new(), false));
        }
        let Some(cond) = &self.cond else {
            return Ok(((0..build.num_rows() as u32).collect(), false));
        };
        // Candidate batch: this probe row repeated, glued to the build side.
        let indices = UInt32Array::from(vec![row as u32; build.num_rows()]);
        let mut fields: Vec<Field> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        for (i, col) in probe.columns().iter().enumerate() {
            let repeated = take(col.as_ref(), &indices, None)
                .map_err(|e| execution(format!("probe repeat failed: {e}")))?;
            fields.push(probe.schema().field(i).clone().with_nullable(true));
            columns.push(repeated);
        }
        for (i, col) in build.columns().iter().enumerate() {
            fields.push(build.schema().field(i).clone().with_nullable(true));
            columns.push(col.clone());
        }
        let candidates = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("candidate batch failed: {e}")))?;
        let verdict: BooleanArray = eval_predicate(cond, &candidates)?;
        let mut hits = Vec::new();
        let mut saw_null = false;
        for b in 0..verdict.len() {
            if verdict.is_null(b) {
                saw_null = true;
            } else if verdict.value(b) {
                hits.push(b as u32);
            }
        }
        Ok((hits, saw_null))
    }

    fn probe(&self, proc: &Process, probe: &RecordBatch) -> Result<Option<Batch>> {
        let build = self.build.as_ref().expect("built");
        let mut probe_idx: Vec<Option<u32>> = Vec::new();
        let mut build_idx: Vec<Option<u32>> = Vec::new();
        let mut marks: Vec<Option<bool>> = Vec::new();
        for row in 0..probe.num_rows() {
            let (hits, saw_null) = self.matches_for_row(probe, row)?;
            match self.kind {
                LoopJoinKind::Inner => {
                    for b in hits {
                        probe_idx.push(Some(row as u32));
                        build_idx.push(Some(b));
                    }
                }
                LoopJoinKind::Left => {
                    if hits.is_empty() {
                        probe_idx.push(Some(row as u32));
                        build_idx.push(None);
                    } else {
                        for b in hits {
                            probe_idx.push(Some(row as u32));
                            build_idx.push(Some(b));
                        }
                    }
                }
                LoopJoinKind::Single => {
                    if hits.len() > 1 {
                        return Err(TidalError::Constraint(
                            "scalar subquery returned more than one row".to_string(),
                        ));
                    }
                    probe_idx.push(Some(row as u32));
                    build_idx.push(hits.first().copied());
                }
                LoopJoinKind::Semi => {
                    if !hits.is_empty() {
                        probe_idx.push(Some(row as u32));
                    }
                }
                LoopJoinKind::Anti => {
                    if hits.is_empty() {
                        probe_idx.push(Some(row as u32));
                    }
                }
                LoopJoinKind::Mark => {
                    probe_idx.push(Some(row as u32));
                    marks.push(if !hits.is_empty() {
                        Some(true)
                    } else if saw_null {
                        None
                    } else {
                        Some(false)
                    });
                }
            }
        }

        let probe_indices: UInt32Array = probe_idx.iter().copied().collect();
        let mut fields: Vec<Field> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        for (i, col) in probe.columns().iter().enumerate() {
            let taken = take(col.as_ref(), &probe_indices, None)
                .map_err(|e| execution(format!("probe take failed: {e}")))?;
            fields.push(probe.schema().field(i).clone().with_nullable(true));
            columns.push(taken);
        }
        match self.kind {
            LoopJoinKind::Inner | LoopJoinKind::Left | LoopJoinKind::Single => {
                let build_indices: UInt32Array = build_idx.iter().copied().collect();
                for (i, col) in build.columns().iter().enumerate() {
                    let taken = if build.num_rows() == 0 {
                        arrow::array::new_null_array(col.data_type(), build_indices.len())
                    } else {
                        take(col.as_ref(), &build_indices, None)
                            .map_err(|e| execution(format!("build take failed: {e}")))?
                    };
                    fields.push(build.schema().field(i).clone().with_nullable(true));
                    columns.push(taken);
                }
            }
            LoopJoinKind::Mark => {
                fields.push(Field::new("mark", DataType::Boolean, true));
                columns.push(Arc::new(marks.iter().copied().collect::<BooleanArray>()));
            }
            LoopJoinKind::Semi | LoopJoinKind::Anti => {}
        }
        let out = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("loop-join output failed: {e}")))?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    /// Drive the join: build once, then one probe batch per call.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        if self.build.is_none() {
            self.finish_build().await?;
        }
        let mut anal = proc.analyze(idx);
        loop {
            let received = self.probe_rx.as_mut().expect("prepared").recv(None).await;
            match received {
                Received::Batch(batch) => {
                    if batch.is_empty() {
                        continue;
                    }
                    anal.input(&batch, is_first);
                    anal.start();
                    let out = self.probe(proc, batch.data())?;
                    anal.stop();
                    if let Some(out) = out {
                        anal.output(&out, is_last);
                        proc.set_input(Some(out));
                        return Ok(false);
                    }
                }
                Received::End => {
                    proc.set_input(None);
                    return Ok(true);
                }
                Received::Cancelled => return Err(TidalError::Cancelled),
            }
        }
    }

    /// Drop build state and drain receivers.
    pub fn free(&mut self, _failed: bool) {
        self.build = None;
        if let Some(rx) = &mut self.probe_rx {
            rx.drain();
        }
        if let Some(rx) = &mut self.build_rx {
            rx.drain();
        }
    }
}

/// Cross product: a loop join with no condition.
pub type ProductArg = LoopJoinArg;

/// Build a product argument.
pub fn product_arg(build_types: Vec<DataType>) -> ProductArg {
    LoopJoinArg::new(LoopJoinKind::Inner, None, build_types)
}
