use serde::{Deserialize, Serialize};

/// Compile-time planning and placement knobs.
///
/// Defaults mirror production behavior; tests lower the thresholds to force
/// specific plan shapes without building large inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Estimated input bytes above which DML runs distributed.
    pub distributed_threshold_bytes: u64,
    /// Per-row byte estimate applied to planner cost (rows) figures.
    pub single_line_size_estimate: u64,
    /// Scanned-block count at which a statement is spread over the full CN list.
    pub min_block_num: usize,
    /// Worker cap per CN for parallel S3 external scans.
    pub s3_parallel_maxnum: usize,
    /// Upper bound on `limit + offset` for the top-offset rewrite.
    pub top_offset_rewrite_max: i64,
    /// Rows per block staged by distributed inserts.
    pub default_block_max_rows: usize,
    /// Extra capacity added to every merge-receiver channel beyond its
    /// producer count.
    pub channel_slack: usize,
    /// Worker count used when the engine reports no CPU figure.
    pub default_ncpu: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            distributed_threshold_bytes: 10 * 1024 * 1024,
            single_line_size_estimate: 300,
            min_block_num: 200,
            s3_parallel_maxnum: 10,
            top_offset_rewrite_max: 8192 * 2,
            default_block_max_rows: 8192,
            channel_slack: 1,
            default_ncpu: num_cpus(),
        }
    }
}

impl CompileConfig {
    /// Whether `cost` estimated rows cross the distributed-DML threshold.
    pub fn crosses_distributed_threshold(&self, cost: f64) -> bool {
        cost * self.single_line_size_estimate as f64 > self.distributed_threshold_bytes as f64
    }
}

/// Number of logical CPUs on the current machine.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_matches_cost_math() {
        let cfg = CompileConfig::default();
        // 200_000 rows x 300 B = 60 MB > 10 MB.
        assert!(cfg.crosses_distributed_threshold(200_000.0));
        // 1_000 rows x 300 B = 300 KB.
        assert!(!cfg.crosses_distributed_threshold(1_000.0));
    }
}
