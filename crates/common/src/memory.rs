//! Per-query memory pool with RAII reservations.
//!
//! Every batch that enters a pipeline holds one reservation; dropping the
//! batch returns its bytes. `current_bytes` therefore returns to its pre-run
//! value on both the success and failure paths, which the runtime tests rely
//! on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, TidalError};

/// Shared per-query byte-accounting pool.
#[derive(Debug)]
pub struct MemoryPool {
    limit_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl MemoryPool {
    /// Create a pool with a hard byte limit. `usize::MAX` disables the limit.
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            in_use_bytes: AtomicUsize::new(0),
        })
    }

    /// Unbounded pool, for sessions that do not configure a budget.
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Bytes currently reserved.
    pub fn current_bytes(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Reserve `bytes` from the pool, failing once the limit would be crossed.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<PoolReservation> {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if self.limit_bytes != usize::MAX && next > self.limit_bytes {
                return Err(TidalError::ResourceExhausted(format!(
                    "memory pool limit {} exceeded: in use {}, requested {}",
                    self.limit_bytes, current, bytes
                )));
            }
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(PoolReservation {
                    pool: Arc::clone(self),
                    bytes,
                });
            }
        }
    }
}

/// RAII reservation that releases pool bytes on drop.
#[derive(Debug)]
pub struct PoolReservation {
    pool: Arc<MemoryPool>,
    bytes: usize,
}

impl PoolReservation {
    /// Bytes held by this reservation.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for PoolReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.pool.in_use_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_releases_bytes_on_drop() {
        let pool = MemoryPool::new(100);
        {
            let r1 = pool.reserve(60).expect("reserve");
            assert_eq!(r1.bytes(), 60);
            assert_eq!(pool.current_bytes(), 60);
            let _r2 = pool.reserve(40).expect("reserve");
            assert_eq!(pool.current_bytes(), 100);
        }
        assert_eq!(pool.current_bytes(), 0);
    }

    #[test]
    fn over_limit_reservation_fails() {
        let pool = MemoryPool::new(10);
        let _held = pool.reserve(8).expect("reserve");
        let err = pool.reserve(4).expect_err("over limit");
        assert!(matches!(err, TidalError::ResourceExhausted(_)));
        assert_eq!(pool.current_bytes(), 8);
    }
}
