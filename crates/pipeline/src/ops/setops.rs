//! Set operations: MINUS, INTERSECT, INTERSECT ALL.
//!
//! Two-receiver heads like the joins: slot 0 streams the left side, slot 1
//! is drained first to build the right-side multiset. Bucketed layouts
//! broadcast both sides and each scope keeps only its hash bucket.

use std::collections::HashMap;

use arrow::record_batch::RecordBatch;
use tidal_common::{Result, TidalError};

use crate::batch::Batch;
use crate::process::Process;
use crate::register::{Received, RegReceiver};
use crate::row::{hash_key, row_key, take_rows, ScalarKey};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

fn in_bucket(nbucket: u64, ibucket: u64, key: &[ScalarKey]) -> bool {
    nbucket <= 1 || hash_key(key) % nbucket == ibucket
}

/// Set-operation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    /// Left rows whose key does not appear on the right, deduplicated.
    Minus,
    /// Distinct keys present on both sides.
    Intersect,
    /// Multiset intersection (minimum multiplicity).
    IntersectAll,
}

/// Set-operation operator argument.
pub struct SetOpArg {
    /// Variant.
    pub kind: SetOpKind,
    /// Bucket slot for broadcast layouts.
    pub ibucket: u64,
    /// Bucket count for broadcast layouts.
    pub nbucket: u64,
    left_rx: Option<RegReceiver>,
    right_rx: Option<RegReceiver>,
    right: Option<HashMap<Vec<ScalarKey>, i64>>,
    emitted: HashMap<Vec<ScalarKey>, i64>,
}

impl SetOpArg {
    /// Set operation of `kind` over bucket `ibucket` of `nbucket`.
    pub fn new(kind: SetOpKind, ibucket: u64, nbucket: u64) -> Self {
        Self {
            kind,
            ibucket,
            nbucket: nbucket.max(1),
            left_rx: None,
            right_rx: None,
            right: None,
            emitted: HashMap::new(),
        }
    }

    /// Take the left (slot 0) and right (slot 1) receivers.
    pub fn prepare(&mut self, proc: &mut Process) -> Result<()> {
        if proc.merge_receivers.len() < 2 {
            return Err(execution("set-op scope needs left and right receivers"));
        }
        self.left_rx = Some(proc.merge_receivers[0].take_receiver());
        self.right_rx = Some(proc.merge_receivers[1].take_receiver());
        Ok(())
    }

    async fn finish_right(&mut self) -> Result<()> {
        let nbucket = self.nbucket;
        let ibucket = self.ibucket;
        let rx = self.right_rx.as_mut().expect("prepared");
        let mut counts: HashMap<Vec<ScalarKey>, i64> = HashMap::new();
        loop {
            match rx.recv(None).await {
                Received::Batch(batch) => {
                    let cols = batch.data().columns().to_vec();
                    for row in 0..batch.rows() {
                        let key = row_key(&cols, row)?;
                        if in_bucket(nbucket, ibucket, &key) {
                            *counts.entry(key).or_insert(0) += 1;
                        }
                    }
                }
                Received::End => break,
                Received::Cancelled => return Err(TidalError::Cancelled),
            }
        }
        self.right = Some(counts);
        Ok(())
    }

    fn filter_left(&mut self, proc: &Process, batch: &RecordBatch) -> Result<Option<Batch>> {
        let nbucket = self.nbucket;
        let ibucket = self.ibucket;
        let right = self.right.as_mut().expect("built");
        let cols = batch.columns().to_vec();
        let mut keep: Vec<u32> = Vec::new();
        for row in 0..batch.num_rows() {
            let key = row_key(&cols, row)?;
            if !in_bucket(nbucket, ibucket, &key) {
                continue;
            }
            let keep_row = match self.kind {
                SetOpKind::Minus => {
                    !right.contains_key(&key) && !self.emitted.contains_key(&key)
                }
                SetOpKind::Intersect => {
                    right.contains_key(&key) && !self.emitted.contains_key(&key)
                }
                SetOpKind::IntersectAll => {
                    let available = right.get(&key).copied().unwrap_or(0);
                    let used = self.emitted.get(&key).copied().unwrap_or(0);
                    used < available
                }
            };
            if keep_row {
                *self.emitted.entry(key).or_insert(0) += 1;
                keep.push(row as u32);
            }
        }
        if keep.is_empty() {
            return Ok(None);
        }
        let out = take_rows(batch, &keep)?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    /// Drive the set operation: drain right, then stream left.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        if self.right.is_none() {
            self.finish_right().await?;
        }
        let mut anal = proc.analyze(idx);
        loop {
            let received = self.left_rx.as_mut().expect("prepared").recv(None).await;
            match received {
                Received::Batch(batch) => {
                    if batch.is_empty() {
                        continue;
                    }
                    anal.input(&batch, is_first);
                    anal.start();
                    let out = self.filter_left(proc, batch.data())?;
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

    /// Drop set state and drain receivers.
    pub fn free(&mut self, _failed: bool) {
        self.right = None;
        self.emitted.clear();
        if let Some(rx) = &mut self.left_rx {
            rx.drain();
        }
        if let Some(rx) = &mut self.right_rx {
            rx.drain();
        }
    }
}
