//! Cluster id allocation backing CN segment ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidal_common::Result;

/// Cluster-wide unique 64-bit id source (the HA-keeper seam).
pub trait IdAllocator: Send + Sync {
    /// Allocate the next cluster-unique id.
    fn allocate_id(&self) -> Result<u64>;
}

/// Process-local allocator for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct LocalIdAllocator {
    next: AtomicU64,
}

impl LocalIdAllocator {
    /// Allocator starting at 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(0),
        })
    }
}

impl IdAllocator for LocalIdAllocator {
    fn allocate_id(&self) -> Result<u64> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let alloc = LocalIdAllocator::new();
        let a = alloc.allocate_id().expect("id");
        let b = alloc.allocate_id().expect("id");
        assert!(b > a);
    }
}
