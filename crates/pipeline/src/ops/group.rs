//! Hash aggregation: per-scope partials, bucketed dedup, and merge-combine.
//!
//! Output convention: group keys first (in declaration order), then one column per
//! aggregate. MergeGroup reuses the same kernel with combine semantics —
//! counts arrive as int64 partials and are summed.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use tidal_common::{Result, TidalError};
use tidal_plan::{AggExpr, AggFunc, Expr};

use crate::batch::Batch;
use crate::evaluator::eval;
use crate::process::Process;
use crate::row::{hash_key, key_at, ScalarKey};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// One aggregate accumulator.
#[derive(Debug, Clone)]
enum Acc {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Min(Option<ScalarKey>),
    Max(Option<ScalarKey>),
}

impl Acc {
    fn new(func: AggFunc, input_type: &DataType) -> Result<Self> {
        Ok(match func {
            AggFunc::Count => Acc::Count(0),
            AggFunc::Sum => match input_type {
                DataType::Float64 => Acc::SumFloat(None),
                _ => Acc::SumInt(None),
            },
            AggFunc::Min => Acc::Min(None),
            AggFunc::Max => Acc::Max(None),
        })
    }

    fn update(&mut self, value: &ScalarKey) -> Result<()> {
        match self {
            Acc::Count(n) => {
                if *value != ScalarKey::Null {
                    *n += 1;
                }
            }
            Acc::SumInt(acc) => match value {
                ScalarKey::Null => {}
                ScalarKey::Int(v) => *acc = Some(acc.unwrap_or(0) + v),
                ScalarKey::UInt(v) => *acc = Some(acc.unwrap_or(0) + *v as i64),
                other => return Err(execution(format!("SUM over non-numeric {other:?}"))),
            },
            Acc::SumFloat(acc) => match value {
                ScalarKey::Null => {}
                ScalarKey::FloatBits(bits) => {
                    *acc = Some(acc.unwrap_or(0.0) + f64::from_bits(*bits))
                }
                other => return Err(execution(format!("SUM over non-float {other:?}"))),
            },
            Acc::Min(acc) => {
                if *value != ScalarKey::Null {
                    let replace = match acc {
                        None => true,
                        Some(current) => key_lt(value, current)?,
                    };
                    if replace {
                        *acc = Some(value.clone());
                    }
                }
            }
            Acc::Max(acc) => {
                if *value != ScalarKey::Null {
                    let replace = match acc {
                        None => true,
                        Some(current) => key_lt(current, value)?,
                    };
                    if replace {
                        *acc = Some(value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn output(&self) -> ScalarKey {
        match self {
            Acc::Count(n) => ScalarKey::Int(*n),
            Acc::SumInt(v) => v.map(ScalarKey::Int).unwrap_or(ScalarKey::Null),
            Acc::SumFloat(v) => v.map(|f| ScalarKey::FloatBits(f.to_bits())).unwrap_or(ScalarKey::Null),
            Acc::Min(v) | Acc::Max(v) => v.clone().unwrap_or(ScalarKey::Null),
        }
    }
}

fn key_lt(a: &ScalarKey, b: &ScalarKey) -> Result<bool> {
    Ok(match (a, b) {
        (ScalarKey::Int(x), ScalarKey::Int(y)) => x < y,
        (ScalarKey::UInt(x), ScalarKey::UInt(y)) => x < y,
        (ScalarKey::FloatBits(x), ScalarKey::FloatBits(y)) => {
            f64::from_bits(*x) < f64::from_bits(*y)
        }
        (ScalarKey::Str(x), ScalarKey::Str(y)) => x < y,
        (ScalarKey::Bool(x), ScalarKey::Bool(y)) => x < y,
        _ => return Err(execution("MIN/MAX over mixed types")),
    })
}

/// Materialize a key column from per-group scalars.
fn build_column(values: &[ScalarKey]) -> ArrayRef {
    let first = values.iter().find(|v| !matches!(v, ScalarKey::Null));
    match first {
        Some(ScalarKey::FloatBits(_)) => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    ScalarKey::FloatBits(b) => Some(f64::from_bits(*b)),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        Some(ScalarKey::Str(_)) => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    ScalarKey::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        Some(ScalarKey::Bool(_)) => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    ScalarKey::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        Some(ScalarKey::UInt(_)) => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    ScalarKey::UInt(u) => Some(*u),
                    _ => None,
                })
                .collect::<UInt64Array>(),
        ),
        _ => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    ScalarKey::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
    }
}

/// Group operator argument (also backs MergeGroup with combine functions).
pub struct GroupArg {
    /// Grouping key expressions.
    pub keys: Vec<Expr>,
    /// Aggregate calls.
    pub aggs: Vec<AggExpr>,
    /// Bucket filter `(ibucket, nbucket)` for broadcast-dedup scopes; rows
    /// hashing outside the bucket are ignored.
    pub bucket: Option<(u64, u64)>,
    groups: HashMap<Vec<ScalarKey>, usize>,
    ordered_keys: Vec<Vec<ScalarKey>>,
    accs: Vec<Vec<Acc>>,
    flushed: bool,
}

impl GroupArg {
    /// Grouping over `keys` with `aggs`.
    pub fn new(keys: Vec<Expr>, aggs: Vec<AggExpr>, bucket: Option<(u64, u64)>) -> Self {
        Self {
            keys,
            aggs,
            bucket,
            groups: HashMap::new(),
            ordered_keys: Vec::new(),
            accs: Vec::new(),
            flushed: false,
        }
    }

    fn absorb(&mut self, batch: &RecordBatch) -> Result<()> {
        let key_cols = self
            .keys
            .iter()
            .map(|k| eval(k, batch))
            .collect::<Result<Vec<_>>>()?;
        let agg_cols = self
            .aggs
            .iter()
            .map(|a| eval(&a.arg, batch))
            .collect::<Result<Vec<_>>>()?;
        for row in 0..batch.num_rows() {
            let key = key_cols
                .iter()
                .map(|c| key_at(c, row))
                .collect::<Result<Vec<_>>>()?;
            if let Some((ibucket, nbucket)) = self.bucket {
                if hash_key(&key) % nbucket != ibucket {
                    continue;
                }
            }
            let slot = match self.groups.get(&key) {
                Some(slot) => *slot,
                None => {
                    let slot = self.ordered_keys.len();
                    self.groups.insert(key.clone(), slot);
                    self.ordered_keys.push(key);
                    let accs = self
                        .aggs
                        .iter()
                        .zip(&agg_cols)
                        .map(|(a, col)| Acc::new(a.func, col.data_type()))
                        .collect::<Result<Vec<_>>>()?;
                    self.accs.push(accs);
                    slot
                }
            };
            for (acc, col) in self.accs[slot].iter_mut().zip(&agg_cols) {
                acc.update(&key_at(col, row)?)?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, proc: &Process) -> Result<Option<Batch>> {
        if self.ordered_keys.is_empty() {
            return Ok(None);
        }
        let key_count = self.keys.len();
        let group_count = self.ordered_keys.len();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(key_count + self.aggs.len());
        for k in 0..key_count {
            let values: Vec<ScalarKey> =
                self.ordered_keys.iter().map(|key| key[k].clone()).collect();
            columns.push(build_column(&values));
        }
        for a in 0..self.aggs.len() {
            let values: Vec<ScalarKey> = (0..group_count).map(|g| self.accs[g][a].output()).collect();
            columns.push(build_column(&values));
        }
        let fields: Vec<Field> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let name = if i < key_count {
                    format!("g{i}")
                } else {
                    format!("a{}", i - key_count)
                };
                Field::new(name, c.data_type().clone(), true)
            })
            .collect();
        let out = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| execution(format!("group output failed: {e}")))?;
        Ok(Some(Batch::new(&proc.pool, out)?))
    }

    /// Accumulate groups; emit them on end-of-stream.
    pub async fn call(
        &mut self,
        proc: &mut Process,
        idx: usize,
        is_first: bool,
        is_last: bool,
    ) -> Result<bool> {
        let mut anal = proc.analyze(idx);
        anal.start();
        match proc.take_input() {
            Some(batch) => {
                anal.input(&batch, is_first);
                if !batch.is_empty() {
                    self.absorb(batch.data())?;
                }
                anal.stop();
                proc.set_input(Some(Batch::empty_marker()));
                Ok(false)
            }
            None => {
                if self.flushed {
                    anal.stop();
                    return Ok(true);
                }
                self.flushed = true;
                let out = self.emit(proc)?;
                if let Some(out) = &out {
                    anal.output(out, is_last);
                }
                anal.stop();
                proc.set_input(out);
                Ok(true)
            }
        }
    }

    /// Drop group state.
    pub fn free(&mut self, _failed: bool) {
        self.groups.clear();
        self.ordered_keys.clear();
        self.accs.clear();
    }
}

/// Build the MergeGroup combine stage for a partial [`GroupArg`] layout:
/// keys become leading columns, every aggregate reads its partial column and
/// counts are summed.
pub fn merge_group_arg(key_count: usize, funcs: &[AggFunc]) -> GroupArg {
    let keys = (0..key_count).map(Expr::Column).collect();
    let aggs = funcs
        .iter()
        .enumerate()
        .map(|(i, func)| AggExpr {
            func: match func {
                AggFunc::Count => AggFunc::Sum,
                other => *other,
            },
            arg: Expr::Column(key_count + i),
        })
        .collect();
    GroupArg::new(keys, aggs, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_common::MemoryPool;
    use tidal_engine::Timestamp;

    fn batch(keys: Vec<i64>, vals: Vec<i64>) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("k", DataType::Int64, false),
                Field::new("v", DataType::Int64, false),
            ])),
            vec![
                Arc::new(Int64Array::from(keys)),
                Arc::new(Int64Array::from(vals)),
            ],
        )
        .expect("batch")
    }

    #[tokio::test]
    async fn groups_and_sums() {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let mut group = GroupArg::new(
            vec![Expr::Column(0)],
            vec![
                AggExpr {
                    func: AggFunc::Sum,
                    arg: Expr::Column(1),
                },
                AggExpr {
                    func: AggFunc::Count,
                    arg: Expr::Column(1),
                },
            ],
            None,
        );
        let b = Batch::new(&proc.pool, batch(vec![1, 2, 1], vec![10, 20, 30])).expect("b");
        proc.set_input(Some(b));
        group.call(&mut proc, 0, true, true).await.expect("absorb");
        proc.set_input(None);
        assert!(group.call(&mut proc, 0, true, true).await.expect("flush"));

        let out = proc.take_input().expect("result");
        assert_eq!(out.rows(), 2);
        let sums = out
            .data()
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        let counts = out
            .data()
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        assert_eq!(sums.values(), &[40, 20]);
        assert_eq!(counts.values(), &[2, 1]);
    }

    #[tokio::test]
    async fn bucket_filter_splits_groups() {
        let mut proc = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        let data = batch(vec![1, 2, 3, 4], vec![1, 1, 1, 1]);

        let mut total = 0;
        for i in 0..2u64 {
            let mut group = GroupArg::new(vec![Expr::Column(0)], vec![], Some((i, 2)));
            let b = Batch::new(&proc.pool, data.clone()).expect("b");
            proc.set_input(Some(b));
            group.call(&mut proc, 0, true, true).await.expect("absorb");
            proc.set_input(None);
            group.call(&mut proc, 0, true, true).await.expect("flush");
            if let Some(out) = proc.take_input() {
                total += out.rows();
            }
        }
        // Every key lands in exactly one bucket.
        assert_eq!(total, 4);
    }
}
