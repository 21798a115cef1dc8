//! Pool-accounted column batches.
//!
//! A [`Batch`] owns its Arrow data plus one pool reservation; dropping it
//! returns the bytes. An empty batch means "no rows this tick, keep pulling";
//! end-of-stream is expressed as `Option::<Batch>::None` at the channel and
//! input-slot level, never as a sentinel batch.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tidal_common::{MemoryPool, PoolReservation, Result};

/// One column batch flowing through a pipeline, owned by exactly one holder.
#[derive(Debug)]
pub struct Batch {
    data: RecordBatch,
    _reservation: Option<PoolReservation>,
}

impl Batch {
    /// Wrap a record batch, charging its memory to `pool`.
    pub fn new(pool: &Arc<MemoryPool>, data: RecordBatch) -> Result<Self> {
        let reservation = pool.reserve(data.get_array_memory_size())?;
        Ok(Self {
            data,
            _reservation: Some(reservation),
        })
    }

    /// Wrap a batch without pool accounting (constant batches owned by the
    /// compiler rather than the pipeline).
    pub fn unpooled(data: RecordBatch) -> Self {
        Self {
            data,
            _reservation: None,
        }
    }

    /// Zero-row marker meaning "no rows this tick, keep pulling". Blocking
    /// operators emit it on absorb ticks so `None` stays reserved for
    /// end-of-stream.
    pub fn empty_marker() -> Self {
        Self::unpooled(RecordBatch::new_empty(std::sync::Arc::new(
            arrow_schema::Schema::empty(),
        )))
    }

    /// Row count.
    pub fn rows(&self) -> usize {
        self.data.num_rows()
    }

    /// Whether this tick carries no rows.
    pub fn is_empty(&self) -> bool {
        self.data.num_rows() == 0
    }

    /// Approximate heap footprint.
    pub fn size_bytes(&self) -> usize {
        self.data.get_array_memory_size()
    }

    /// Borrow the Arrow data.
    pub fn data(&self) -> &RecordBatch {
        &self.data
    }

    /// Take the Arrow data, releasing the reservation.
    pub fn into_data(self) -> RecordBatch {
        self.data
    }

    /// Explicit copy for fan-out; each copy carries its own reservation.
    /// Cloning is deliberately not `Clone` so single-ownership violations are
    /// visible at the call site.
    pub fn duplicate(&self, pool: &Arc<MemoryPool>) -> Result<Self> {
        Self::new(pool, self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    fn small_batch() -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2, 3]))],
        )
        .expect("batch")
    }

    #[test]
    fn drop_returns_pool_bytes() {
        let pool = MemoryPool::unbounded();
        {
            let batch = Batch::new(&pool, small_batch()).expect("batch");
            assert!(pool.current_bytes() > 0);
            assert_eq!(batch.rows(), 3);
        }
        assert_eq!(pool.current_bytes(), 0);
    }

    #[test]
    fn duplicate_holds_its_own_reservation() {
        let pool = MemoryPool::unbounded();
        let batch = Batch::new(&pool, small_batch()).expect("batch");
        let bytes_one = pool.current_bytes();
        let copy = batch.duplicate(&pool).expect("duplicate");
        assert_eq!(pool.current_bytes(), bytes_one * 2);
        drop(batch);
        assert_eq!(pool.current_bytes(), bytes_one);
        drop(copy);
        assert_eq!(pool.current_bytes(), 0);
    }
}
