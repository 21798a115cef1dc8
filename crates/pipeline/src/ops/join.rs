//! Hash joins.
//!
//! A join scope has exactly two merge receivers: slot 0 carries probe rows,
//! slot 1 carries build rows (the build scope concatenates and broadcasts
//! them via HashBuild + Dispatch). The join operator drains the build side
//! completely, then streams the probe side one batch per call.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::future::select_all;
use tidal_common::{Result, TidalError};

use crate::batch::Batch;
use crate::process::Process;
use crate::register::{Received, RegReceiver};
use crate::row::{concat, key_at, ScalarKey};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// Hash-join variants sharing one probe kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Inner equi join.
    Inner,
    /// Left outer join.
    Left,
    /// Scalar-subquery join: at most one build match per probe row.
    Single,
    /// Semi join (probe columns only).
    Semi,
    /// Anti join (probe columns only).
    Anti,
    /// Right outer join.
    Right,
    /// Right semi join (build columns only).
    RightSemi,
    /// Right anti join (build columns only).
    RightAnti,
}

impl JoinKind {
    fn emits_build_columns(self) -> bool {
        matches!(self, JoinKind::Inner | JoinKind::Left | JoinKind::Single | JoinKind::Right)
    }

    fn emits_probe_columns(self) -> bool {
        !matches!(self, JoinKind::RightSemi | JoinKind::RightAnti)
    }
}

struct BuildState {
    batch: RecordBatch,
    map: HashMap<Vec<ScalarKey>, Vec<u32>>,
    matched: Vec<bool>,
}

/// Hash-join operator argument.
pub struct JoinArg {
    /// Join variant.
    pub kind: JoinKind,
    /// Equi conditions as (probe column, build column) pairs.
    pub conds: Vec<(usize, usize)>,
    /// Probe-side column types, for null padding on right flushes.
    pub probe_types: Vec<DataType>,
    /// Build-side column types, for null padding and empty builds.
    pub build_types: Vec<DataType>,
    /// Bucket assignment for bucketed layouts (right variants).
    pub ibucket: u64,
    /// Bucket count for bucketed layouts.
    pub nbucket: u64,
    probe_rx: Option<RegReceiver>,
    build_rx: Option<RegReceiver>,
    build: Option<BuildState>,
    flushed: bool,
}

impl JoinArg {
    /// Join of `kind` over `conds`.
    pub fn new(
        kind: JoinKind,
        conds: Vec<(usize, usize)>,
        probe_types: Vec<DataType>,
        build_types: Vec<DataType>,
    ) -> Self {
        Self {
            kind,
            conds,
            probe_types,
            build_types,
            ibucket: 0,
            nbucket: 1,
            probe_rx: None,
            build_rx: None,
            build: None,
            flushed: false,
        }
    }

    /// Set the bucket slot for bucketed right-variant layouts.
    pub fn with_bucket(mut self, ibucket: u64, nbucket: u64) -> Self {
        self.ibucket = ibucket;
        self.nbucket = nbucket;
        self
    }

    /// Take the probe (slot 0) and build (slot 1) receivers.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        if proc.merge_receivers.len() < 2 {
            return Err(execution("join scope needs probe and build receivers"));
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

    async fn finish_build(&mut self, proc: &mut Process, idx: usize) -> Result<()> {
        let rx = self.build_rx.as_mut().expect("prepared");
        let mut staged: Vec<RecordBatch> = Vec::new();
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
        let batch = concat(&schema, &staged)?;
        proc.analyze(idx).alloc(batch.get_array_memory_size() as i64);
        let build_cols: Vec<ArrayRef> = self
            .conds
            .iter()
            .map(|(_, b)| {
                batch
                    .columns()
                    .get(*b)
                    .cloned()
                    .ok_or_else(|| execution(format!("build key column {b} missing")))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut map: HashMap<Vec<ScalarKey>, Vec<u32>> = HashMap::new();
        for row in 0..batch.num_rows() {
            let key = build_cols
                .iter()
                .map(|c| key_at(c, row))
                .collect::<Result<Vec<_>>>()?;
            // NULL keys never match anything.
            if key.iter().any(|k| *k == ScalarKey::Null) {
                continue;
            }
            map.entry(key).or_default().push(row as u32);
        }
        let matched = vec![false; batch.num_rows()];
        self.build = Some(BuildState {
            batch,
            map,
            matched,
        });
        Ok(())
    }

    fn probe(&mut self, proc: &Process, probe: &RecordBatch) -> Result<Option<Batch>> {
        let build = self.build.as_mut().expect("built");
        let probe_keys: Vec<ArrayRef> = self
            .conds
            .iter()
            .map(|(p, _)| {
                probe
                    .columns()
                    .get(*p)
                    .cloned()
                    .ok_or_else(|| execution(format!("probe key column {p} missing")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut probe_idx: Vec<Option<u32>> = Vec::new();
        let mut build_idx: Vec<Option<u32>> = Vec::new();
        for row in 0..probe.num_rows() {
            let key = probe_keys
                .iter()
                .map(|c| key_at(c, row))
                .collect::<Result<Vec<_>>>()?;
            let hits = if key.iter().any(|k| *k == ScalarKey::Null) {
                None
            } else {
                build.map.get(&key)
            };
            match self.kind {
                JoinKind::Inner | JoinKind::Right => {
                    if let Some(hits) = hits {
                        for b in hits {
                            probe_idx.push(Some(row as u32));
                            build_idx.push(Some(*b));
                            build.matched[*b as usize] = true;
                        }
                    }
                }
                JoinKind::Left => match hits {
                    Some(hits) => {
                        for b in hits {
                            probe_idx.push(Some(row as u32));
                            build_idx.push(Some(*b));
                        }
                    }
                    None => {
                        probe_idx.push(Some(row as u32));
                        build_idx.push(None);
                    }
                },
                JoinKind::Single => match hits {
                    Some(hits) if hits.len() > 1 => {
                        return Err(TidalError::Constraint(
                            "scalar subquery returned more than one row".to_string(),
                        ))
                    }
                    Some(hits) => {
                        probe_idx.push(Some(row as u32));
                        build_idx.push(Some(hits[0]));
                    }
                    None => {
                        probe_idx.push(Some(row as u32));
                        build_idx.push(None);
                    }
                },
                JoinKind::Semi => {
                    if hits.map(|h| !h.is_empty()).unwrap_or(false) {
                        probe_idx.push(Some(row as u32));
                    }
                }
                JoinKind::Anti => {
                    if hits.map(|h| h.is_empty()).unwrap_or(true) {
                        probe_idx.push(Some(row as u32));
                    }
                }
                JoinKind::RightSemi | JoinKind::RightAnti => {
                    if let Some(hits) = hits {
                        for b in hits {
                            build.matched[*b as usize] = true;
                        }
                    }
                }
            }
        }

        if !self.kind.emits_probe_columns() {
            // Right-semi/anti emit only at flush time.
            return Ok(None);
        }
        let mut columns: Vec<ArrayRef> = Vec::new();
        let mut fields: Vec<Field> = Vec::new();
        let probe_indices: UInt32Array = probe_idx.iter().copied().collect();
        for (i, col) in probe.columns().iter().enumerate() {
            let taken = take(col.as_ref(), &probe_indices, None)
                .map_err(|e| execution(format!("probe take failed: {e}")))?;
            fields.push(probe.schema().field(i).clone().with_nullable(true));
            columns.push(taken);
        }
        if self.kind.emits_build_columns() {
            let build_indices: UInt32Array = build_idx.iter().copied().collect();
            for (i, col) in build.batch.columns().iter().enumerate() {
                let taken = if build.batch.num_rows() == 0 {
                    new_null_array(col.data_type(), build_indices.len())
                } else {
                    take(col.as_ref(), &build_indices, None)
                        .map_err(|e| execution(format!("build take failed: {e}")))?
                };
                fields.push(build.batch.schema().field(i).clone().with_nullable(true));
                columns.push(taken);
            }
        }
        let out = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("join output failed: {e}")))?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    fn flush(&mut self, proc: &Process) -> Result<Option<Batch>> {
        if self.flushed {
            return Ok(None);
        }
        self.flushed = true;
        let build = self.build.as_ref().expect("built");
        let wanted_matched = matches!(self.kind, JoinKind::RightSemi);
        let rows: Vec<u32> = match self.kind {
            JoinKind::Right | JoinKind::RightAnti => build
                .matched
                .iter()
                .enumerate()
                .filter(|(_, m)| !**m)
                .map(|(i, _)| i as u32)
                .collect(),
            JoinKind::RightSemi => build
                .matched
                .iter()
                .enumerate()
                .filter(|(_, m)| **m == wanted_matched)
                .map(|(i, _)| i as u32)
                .collect(),
            _ => return Ok(None),
        };
        if rows.is_empty() {
            return Ok(None);
        }
        let indices = UInt32Array::from(rows);
        let mut fields: Vec<Field> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        if self.kind == JoinKind::Right {
            // Unmatched build rows pad the probe side with NULLs.
            for (i, t) in self.probe_types.iter().enumerate() {
                fields.push(Field::new(format!("p{i}"), t.clone(), true));
                columns.push(new_null_array(t, indices.len()));
            }
        }
        for (i, col) in build.batch.columns().iter().enumerate() {
            let taken = take(col.as_ref(), &indices, None)
                .map_err(|e| execution(format!("flush take failed: {e}")))?;
            fields.push(build.batch.schema().field(i).clone().with_nullable(true));
            columns.push(taken);
        }
        let out = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("join flush failed: {e}")))?;
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
            self.finish_build(proc, idx).await?;
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
                    match out {
                        Some(out) => {
                            anal.output(&out, is_last);
                            proc.set_input(Some(out));
                            return Ok(false);
                        }
                        None => continue,
                    }
                }
                Received::End => {
                    let out = self.flush(proc)?;
                    if let Some(out) = &out {
                        anal.output(out, is_last);
                    }
                    proc.set_input(out);
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

/// Build-side head: concatenates the build stream into one batch and
/// forwards it (the broadcast dispatcher fans it out to every join scope).
#[derive(Default)]
pub struct HashBuildArg {
    receivers: Vec<RegReceiver>,
    staged: Vec<RecordBatch>,
    emitted: bool,
}

impl HashBuildArg {
    /// Take the build scope's receivers.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        self.receivers = proc
            .merge_receivers
            .iter_mut()
            .map(|r| r.take_receiver())
            .collect();
        Ok(())
    }

    /// Accumulate the whole build side, emit it once, then end.
    pub async fn call(&mut self, proc: &mut Process, idx: usize, is_first: bool) -> Result<bool> {
        let anal = proc.analyze(idx);
        if self.emitted {
            proc.set_input(None);
            return Ok(true);
        }
        loop {
            if self.receivers.is_empty() {
                self.emitted = true;
                if self.staged.is_empty() {
                    proc.set_input(None);
                    return Ok(true);
                }
                let schema = self.staged[0].schema();
                let staged = std::mem::take(&mut self.staged);
                let combined = concat(&schema, &staged)?;
                anal.alloc(combined.get_array_memory_size() as i64);
                proc.set_input(Some(Batch::new(&proc.pool, combined)?));
                return Ok(false);
            }
            let futures: Vec<_> = self
                .receivers
                .iter_mut()
                .map(|r| Box::pin(r.recv(None)))
                .collect();
            let (received, winner, _) = select_all(futures).await;
            match received {
                Received::Batch(batch) => {
                    anal.input(&batch, is_first);
                    if !batch.is_empty() {
                        self.staged.push(batch.data().clone());
                    }
                }
                Received::End => {
                    self.receivers.swap_remove(winner);
                }
                Received::Cancelled => return Err(TidalError::Cancelled),
            }
        }
    }

    /// Drop staged build rows.
    pub fn free(&mut self, _failed: bool) {
        self.staged.clear();
        for r in &mut self.receivers {
            r.drain();
        }
    }
}
