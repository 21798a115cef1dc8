//! Row-level keys, hashing, and batch assembly helpers shared by the
//! grouping, join, set-operation, and dispatch operators.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use tidal_common::{Result, TidalError};

fn execution(msg: impl Into<String>) -> TidalError {
    TidalError::Execution(msg.into())
}

/// One column value usable as a hash/equality key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Unsigned integer value.
    UInt(u64),
    /// Float value keyed by bit pattern.
    FloatBits(u64),
    /// String value.
    Str(String),
}

/// Extract the key for `row` of `array`.
pub fn key_at(array: &ArrayRef, row: usize) -> Result<ScalarKey> {
    if array.is_null(row) {
        return Ok(ScalarKey::Null);
    }
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Ok(ScalarKey::Int(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<UInt64Array>() {
        return Ok(ScalarKey::UInt(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return Ok(ScalarKey::FloatBits(a.value(row).to_bits()));
    }
    if let Some(a) = any.downcast_ref::<StringArray>() {
        return Ok(ScalarKey::Str(a.value(row).to_string()));
    }
    if let Some(a) = any.downcast_ref::<BooleanArray>() {
        return Ok(ScalarKey::Bool(a.value(row)));
    }
    Err(execution(format!(
        "unsupported key column type {:?}",
        array.data_type()
    )))
}

/// Composite key for `row` over `cols`.
pub fn row_key(cols: &[ArrayRef], row: usize) -> Result<Vec<ScalarKey>> {
    cols.iter().map(|c| key_at(c, row)).collect()
}

/// Stable hash of a composite key.
pub fn hash_key(key: &[ScalarKey]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Hash every row of `cols` in one pass.
pub fn hash_rows(cols: &[ArrayRef], rows: usize) -> Result<Vec<u64>> {
    (0..rows).map(|r| Ok(hash_key(&row_key(cols, r)?))).collect()
}

/// Gather `indices` rows out of `batch`.
pub fn take_rows(batch: &RecordBatch, indices: &[u32]) -> Result<RecordBatch> {
    let idx = UInt32Array::from(indices.to_vec());
    let cols = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &idx, None).map_err(|e| execution(format!("take failed: {e}"))))
        .collect::<Result<Vec<_>>>()?;
    RecordBatch::try_new(batch.schema(), cols).map_err(|e| execution(format!("take batch: {e}")))
}

/// Concatenate batches under a known schema; empty input yields an empty batch.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    arrow::compute::concat_batches(schema, batches)
        .map_err(|e| execution(format!("concat failed: {e}")))
}

/// Sort `batch` by `specs`, honoring per-key direction and NULL placement.
pub fn sort_batch(
    batch: &RecordBatch,
    specs: &[tidal_plan::OrderSpec],
    limit: Option<usize>,
) -> Result<RecordBatch> {
    let columns = specs
        .iter()
        .map(|spec| {
            let values = crate::evaluator::eval(&spec.expr, batch)?;
            Ok(arrow::compute::SortColumn {
                values,
                options: Some(arrow::compute::SortOptions {
                    descending: spec.desc,
                    nulls_first: !spec.nulls_last(),
                }),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let indices = arrow::compute::lexsort_to_indices(&columns, limit)
        .map_err(|e| execution(format!("sort failed: {e}")))?;
    let rows: Vec<u32> = indices.values().to_vec();
    take_rows(batch, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn keys_hash_stably() {
        let col: ArrayRef = Arc::new(Int64Array::from(vec![Some(7), Some(7), None]));
        let k0 = row_key(&[col.clone()], 0).expect("key");
        let k1 = row_key(&[col.clone()], 1).expect("key");
        let k2 = row_key(&[col], 2).expect("key");
        assert_eq!(k0, k1);
        assert_eq!(hash_key(&k0), hash_key(&k1));
        assert_eq!(k2, vec![ScalarKey::Null]);
    }

    #[test]
    fn take_rows_gathers() {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![10_i64, 20, 30]))],
        )
        .expect("batch");
        let taken = take_rows(&batch, &[2, 0]).expect("take");
        let col = taken
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        assert_eq!(col.values(), &[30, 10]);
    }
}
