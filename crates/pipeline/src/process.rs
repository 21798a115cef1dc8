//! Per-query execution context.
//!
//! One session-level [`Process`] is created per statement; every scope gets a
//! child process sharing the pool, counters, and service handles but owning
//! its own merge receivers and a child cancellation token.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tidal_common::MemoryPool;
use tidal_engine::{FileService, Timestamp, TxnClient, TxnOperator};
use tokio_util::sync::CancellationToken;

use crate::analyze::{Analyze, AnalyzeInfo, S3CounterSet};
use crate::batch::Batch;
use crate::register::WaitRegister;
use crate::remote::{ReceiverRegistry, RemoteSender, SegmentAllocator};

/// Execution context shared down a scope tree.
pub struct Process {
    /// Cancellation token; child scopes hold children of it.
    pub cancel: CancellationToken,
    /// Memory pool batches charge against.
    pub pool: Arc<MemoryPool>,
    /// Snapshot timestamp reads run at.
    pub snapshot_ts: Timestamp,
    /// Object-store request counters for analyze attribution.
    pub s3: Arc<S3CounterSet>,
    /// Ordered input channels for this scope.
    pub merge_receivers: Vec<WaitRegister>,
    /// Constant batch prepared for value scans of prepared statements.
    pub prepare_batch: Option<RecordBatch>,
    /// Bulk-load pipeline marker.
    pub load_tag: bool,
    /// Session transaction, when one exists.
    pub txn_operator: Option<Arc<dyn TxnOperator>>,
    /// Transaction client for load-path auto transactions.
    pub txn_client: Option<Arc<dyn TxnClient>>,
    /// Staged-block storage for distributed writes.
    pub file_service: Option<Arc<dyn FileService>>,
    /// Outbound inter-CN transport.
    pub remote: Option<Arc<dyn RemoteSender>>,
    /// Node-local receiver registry.
    pub registry: Option<Arc<dyn ReceiverRegistry>>,
    /// CN segment allocator.
    pub segments: Option<Arc<dyn SegmentAllocator>>,
    analyze_nodes: Arc<Vec<Arc<AnalyzeInfo>>>,
    input: Option<Batch>,
}

impl Process {
    /// Session-level process with `analyze_count` plan-node counter slots.
    pub fn new(pool: Arc<MemoryPool>, snapshot_ts: Timestamp, analyze_count: usize) -> Self {
        let nodes = (0..analyze_count.max(1))
            .map(|_| Arc::new(AnalyzeInfo::default()))
            .collect::<Vec<_>>();
        Self {
            cancel: CancellationToken::new(),
            pool,
            snapshot_ts,
            s3: Arc::new(S3CounterSet::default()),
            merge_receivers: Vec::new(),
            prepare_batch: None,
            load_tag: false,
            txn_operator: None,
            txn_client: None,
            file_service: None,
            remote: None,
            registry: None,
            segments: None,
            analyze_nodes: Arc::new(nodes),
            input: None,
        }
    }

    /// Child process for one scope: shared counters and services, its own
    /// receivers and cancellation scope.
    pub fn new_child(&self, receiver_count: usize, channel_capacity: usize) -> Self {
        let cancel = self.cancel.child_token();
        let merge_receivers = (0..receiver_count)
            .map(|_| WaitRegister::new(channel_capacity, &cancel))
            .collect();
        Self {
            cancel,
            pool: Arc::clone(&self.pool),
            snapshot_ts: self.snapshot_ts,
            s3: Arc::clone(&self.s3),
            merge_receivers,
            prepare_batch: None,
            load_tag: self.load_tag,
            txn_operator: self.txn_operator.clone(),
            txn_client: self.txn_client.clone(),
            file_service: self.file_service.clone(),
            remote: self.remote.clone(),
            registry: self.registry.clone(),
            segments: self.segments.clone(),
            analyze_nodes: Arc::clone(&self.analyze_nodes),
            input: None,
        }
    }

    /// Resize the analyze slots to the compiled plan's node count. Called
    /// once per statement before any child process is derived.
    pub fn reset_analyze(&mut self, count: usize) {
        self.analyze_nodes = Arc::new(
            (0..count.max(1))
                .map(|_| Arc::new(AnalyzeInfo::default()))
                .collect(),
        );
    }

    /// Analyze handle for plan node `idx` (clamped to the last slot so a
    /// missing idx never panics mid-pipeline).
    pub fn analyze(&self, idx: usize) -> Analyze {
        let idx = idx.min(self.analyze_nodes.len() - 1);
        Analyze::new(Arc::clone(&self.analyze_nodes[idx]))
    }

    /// All analyze slots, for the statement-end write-back.
    pub fn analyze_nodes(&self) -> &[Arc<AnalyzeInfo>] {
        &self.analyze_nodes
    }

    /// Set the inter-instruction batch slot; `None` is end-of-stream.
    pub fn set_input(&mut self, input: Option<Batch>) {
        self.input = input;
    }

    /// Take the inter-instruction batch slot.
    pub fn take_input(&mut self) -> Option<Batch> {
        self.input.take()
    }

    /// Whether the slot currently carries a batch.
    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Cancel this scope subtree and every register hanging off it.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Drain queued batches from every receiver into the pool (failure path).
    pub fn drain_receivers(&mut self) {
        for reg in &mut self.merge_receivers {
            reg.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_shares_counters_and_pool() {
        let pool = MemoryPool::unbounded();
        let parent = Process::new(Arc::clone(&pool), Timestamp::default(), 3);
        let child = parent.new_child(2, 4);
        assert_eq!(child.merge_receivers.len(), 2);
        assert_eq!(child.analyze_nodes().len(), 3);
        assert!(Arc::ptr_eq(&child.pool, &parent.pool));

        parent.cancel_all();
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn analyze_idx_is_clamped() {
        let parent = Process::new(MemoryPool::unbounded(), Timestamp::default(), 1);
        // Out-of-range idx falls back to the last slot instead of panicking.
        let _ = parent.analyze(17);
    }
}
