//! ON DUPLICATE KEY handling ahead of PreInsert.
//!
//! Runs single-authority (the compiler pins the plan to one local worker):
//! rows whose key already exists in the target table or earlier in the
//! statement are dropped rather than inserted again. Update-expression
//! evaluation is a function-kernel concern outside this operator.

use std::collections::HashSet;
use std::sync::Arc;

use tidal_common::{Result, TidalError};
use tidal_engine::Relation;

use crate::batch::Batch;
use crate::process::Process;
use crate::row::{key_at, take_rows, ScalarKey};

/// OnDuplicateKey operator argument.
pub struct OnDuplicateKeyArg {
    /// Target relation, consulted once for existing keys.
    pub rel: Arc<dyn Relation>,
    /// Key column positions in the insert batch.
    pub key_cols: Vec<usize>,
    seen: HashSet<Vec<ScalarKey>>,
    loaded: bool,
}

impl OnDuplicateKeyArg {
    /// Dedup on `key_cols` against `rel`.
    pub fn new(rel: Arc<dyn Relation>, key_cols: Vec<usize>) -> Self {
        Self {
            rel,
            key_cols,
            seen: HashSet::new(),
            loaded: false,
        }
    }

    async fn load_existing(&mut self, proc: &Process) -> Result<()> {
        let def = self.rel.table_def();
        let key_names: Vec<String> = self
            .key_cols
            .iter()
            .map(|i| {
                def.cols
                    .get(*i)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        TidalError::Plan(format!("duplicate key column {i} out of range"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let ranges = self.rel.ranges(&[]).await?;
        let mut readers = self.rel.new_readers(1, None, ranges).await?;
        for reader in &mut readers {
            while let Some(batch) = reader.read(&key_names, None, &proc.pool).await? {
                let cols = batch.columns().to_vec();
                for row in 0..batch.num_rows() {
                    let key = cols
                        .iter()
                        .map(|c| key_at(c, row))
                        .collect::<Result<Vec<_>>>()?;
                    self.seen.insert(key);
                }
            }
            reader.close();
        }
        Ok(())
    }

    /// Drop rows whose key was already seen.
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
        if batch.is_empty() {
            proc.set_input(Some(batch));
            return Ok(false);
        }
        if !self.loaded {
            self.loaded = true;
            self.load_existing(proc).await?;
        }
        let mut anal = proc.analyze(idx);
        anal.start();
        anal.input(&batch, is_first);
        let cols: Vec<_> = self
            .key_cols
            .iter()
            .map(|i| {
                batch
                    .data()
                    .columns()
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| TidalError::Plan(format!("duplicate key column {i} missing")))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut keep: Vec<u32> = Vec::new();
        for row in 0..batch.rows() {
            let key = cols
                .iter()
                .map(|c| key_at(c, row))
                .collect::<Result<Vec<_>>>()?;
            if self.seen.insert(key) {
                keep.push(row as u32);
            }
        }
        let out = take_rows(batch.data(), &keep)?;
        drop(batch);
        let out = Batch::new(&proc.pool, out)?;
        anal.output(&out, is_last);
        anal.stop();
        proc.set_input(Some(out));
        Ok(false)
    }
}
