//! Per-node analyze counters written back into the plan after execution.

use serde::{Deserialize, Serialize};

/// Point-in-time copy of one node's execution counters.
///
/// The live counters are atomics owned by the process (pipeline crate); at
/// statement end the runner snapshots them into the plan node so EXPLAIN
/// ANALYZE and slow-query logging read a stable view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeSummary {
    /// Rows read by the node's first operator.
    pub input_rows: i64,
    /// Rows emitted by the node's last operator.
    pub output_rows: i64,
    /// Bytes read.
    pub input_size: i64,
    /// Bytes emitted.
    pub output_size: i64,
    /// Nanoseconds spent inside operator calls.
    pub time_consumed: i64,
    /// Nanoseconds spent blocked on upstream channels.
    pub wait_time: i64,
    /// Peak extra bytes allocated by the node's operators.
    pub memory_size: i64,
    /// Local disk bytes read.
    pub disk_io: i64,
    /// Object-store bytes transferred.
    pub s3_io_byte: i64,
    /// Object-store write-side request count.
    pub s3_input_count: i64,
    /// Object-store read-side request count.
    pub s3_output_count: i64,
    /// Bytes moved across CN boundaries.
    pub network_io: i64,
    /// Nanoseconds spent inside storage reads.
    pub scan_time: i64,
    /// Nanoseconds spent inside storage writes.
    pub insert_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_defaults_to_zero() {
        let s = AnalyzeSummary::default();
        assert_eq!(s.input_rows, 0);
        assert_eq!(s.s3_output_count, 0);
    }
}
