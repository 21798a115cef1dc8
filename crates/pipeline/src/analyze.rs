//! Live per-plan-node execution counters.
//!
//! One [`AnalyzeInfo`] per plan node is shared by every operator the node
//! compiled into, across scopes and CNs. Counters are atomics; the runner
//! snapshots them into [`tidal_plan::AnalyzeSummary`] at statement end.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tidal_plan::AnalyzeSummary;

use crate::batch::Batch;

/// Atomic counters for one plan node.
#[derive(Debug, Default)]
pub struct AnalyzeInfo {
    /// Rows read by the node's first operator.
    pub input_rows: AtomicI64,
    /// Rows emitted by the node's last operator.
    pub output_rows: AtomicI64,
    /// Bytes read.
    pub input_size: AtomicI64,
    /// Bytes emitted.
    pub output_size: AtomicI64,
    /// Nanoseconds inside operator calls.
    pub time_consumed: AtomicI64,
    /// Nanoseconds blocked on upstream channels.
    pub wait_time: AtomicI64,
    /// Extra bytes allocated by operators.
    pub memory_size: AtomicI64,
    /// Local disk bytes read.
    pub disk_io: AtomicI64,
    /// Object-store bytes.
    pub s3_io_byte: AtomicI64,
    /// Object-store write requests.
    pub s3_input_count: AtomicI64,
    /// Object-store read requests.
    pub s3_output_count: AtomicI64,
    /// Bytes crossing CN boundaries.
    pub network_io: AtomicI64,
    /// Nanoseconds inside storage reads.
    pub scan_time: AtomicI64,
    /// Nanoseconds inside storage writes.
    pub insert_time: AtomicI64,
}

impl AnalyzeInfo {
    /// Snapshot into the plan-facing summary.
    pub fn summary(&self) -> AnalyzeSummary {
        AnalyzeSummary {
            input_rows: self.input_rows.load(Ordering::Relaxed),
            output_rows: self.output_rows.load(Ordering::Relaxed),
            input_size: self.input_size.load(Ordering::Relaxed),
            output_size: self.output_size.load(Ordering::Relaxed),
            time_consumed: self.time_consumed.load(Ordering::Relaxed),
            wait_time: self.wait_time.load(Ordering::Relaxed),
            memory_size: self.memory_size.load(Ordering::Relaxed),
            disk_io: self.disk_io.load(Ordering::Relaxed),
            s3_io_byte: self.s3_io_byte.load(Ordering::Relaxed),
            s3_input_count: self.s3_input_count.load(Ordering::Relaxed),
            s3_output_count: self.s3_output_count.load(Ordering::Relaxed),
            network_io: self.network_io.load(Ordering::Relaxed),
            scan_time: self.scan_time.load(Ordering::Relaxed),
            insert_time: self.insert_time.load(Ordering::Relaxed),
        }
    }
}

/// Object-store request counters threaded through the process context so
/// reads are attributed to the plan node that triggered them.
#[derive(Debug, Default)]
pub struct S3CounterSet {
    /// PUT requests.
    pub put: AtomicI64,
    /// GET requests.
    pub get: AtomicI64,
    /// LIST requests.
    pub list: AtomicI64,
    /// HEAD requests.
    pub head: AtomicI64,
    /// DELETE requests.
    pub delete: AtomicI64,
}

/// Per-operator handle over one node's counters; mirrors the
/// start/stop/input/output reporting protocol.
pub struct Analyze {
    info: Arc<AnalyzeInfo>,
    started: Option<Instant>,
}

impl Analyze {
    /// Handle over `info`.
    pub fn new(info: Arc<AnalyzeInfo>) -> Self {
        Self {
            info,
            started: None,
        }
    }

    /// Mark the beginning of one operator call.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Mark the end of one operator call.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.info
                .time_consumed
                .fetch_add(started.elapsed().as_nanos() as i64, Ordering::Relaxed);
        }
    }

    /// Record a batch entering the node (only the first operator reports).
    pub fn input(&self, batch: &Batch, is_first: bool) {
        if !is_first {
            return;
        }
        self.info
            .input_rows
            .fetch_add(batch.rows() as i64, Ordering::Relaxed);
        self.info
            .input_size
            .fetch_add(batch.size_bytes() as i64, Ordering::Relaxed);
    }

    /// Record a batch leaving the node (only the last operator reports).
    pub fn output(&self, batch: &Batch, is_last: bool) {
        if !is_last {
            return;
        }
        self.info
            .output_rows
            .fetch_add(batch.rows() as i64, Ordering::Relaxed);
        self.info
            .output_size
            .fetch_add(batch.size_bytes() as i64, Ordering::Relaxed);
    }

    /// Record time spent blocked on an upstream channel.
    pub fn wait(&self, nanos: i64) {
        self.info.wait_time.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Record extra operator allocation.
    pub fn alloc(&self, bytes: i64) {
        self.info.memory_size.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes sent across CN boundaries.
    pub fn network(&self, bytes: i64) {
        self.info.network_io.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record storage read time.
    pub fn scan(&self, nanos: i64) {
        self.info.scan_time.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Record storage write time.
    pub fn insert(&self, nanos: i64) {
        self.info.insert_time.fetch_add(nanos, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use tidal_common::MemoryPool;

    #[test]
    fn input_counts_only_for_first_operator() {
        let info = Arc::new(AnalyzeInfo::default());
        let pool = MemoryPool::unbounded();
        let batch = Batch::new(
            &pool,
            RecordBatch::try_new(
                Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)])),
                vec![Arc::new(Int64Array::from(vec![1_i64, 2]))],
            )
            .expect("batch"),
        )
        .expect("batch");

        let handle = Analyze::new(Arc::clone(&info));
        handle.input(&batch, false);
        assert_eq!(info.input_rows.load(Ordering::Relaxed), 0);
        handle.input(&batch, true);
        assert_eq!(info.input_rows.load(Ordering::Relaxed), 2);
        assert_eq!(info.summary().input_rows, 2);
    }
}
