//! Tunable knobs for the pipeline, collected into one `serde`-(de)serializable
//! struct so a host process can load it from whatever settings store it
//! already owns without this crate depending on that store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound, in bytes, on the byte cache's total cost.
    pub byte_cache_budget_bytes: u64,
    /// FileCache capacity (distinct open file handles).
    pub max_open_files: usize,
    /// FileCache sweeper threshold: handles idle longer than this are closed.
    pub idle_file_close_seconds: u64,
    /// Per-read budget before `read` surfaces `ReadError::Timeout`.
    pub read_timeout_ms: u64,
    /// Descriptors since last snapshot before an auto-snapshot on `snapshot(false)`.
    pub snapshot_threshold: u64,
    /// Descriptors since last snapshot that triggers a snapshot inside `append_batch`.
    pub batch_snapshot_threshold: u64,
    /// Packet count that triggers early scan termination once stride is confirmed.
    pub parser_early_terminate_packets: usize,
    /// Consecutive matching deltas required to confirm a learned stride.
    pub parser_stride_confirm_hits: usize,
    /// Retry attempts for a transient seek/read failure before surfacing an error.
    pub read_retry_attempts: u32,
    /// Delay between read retries.
    pub read_retry_backoff_ms: u64,
    /// FileCache sweeper tick interval.
    pub file_sweep_interval_secs: u64,
    /// FeatureExtractor worker pool size; 0 means "number of logical CPUs".
    pub feature_worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            byte_cache_budget_bytes: 10 * 1024 * 1024,
            max_open_files: 20,
            idle_file_close_seconds: 300,
            read_timeout_ms: 5_000,
            snapshot_threshold: 10_000,
            batch_snapshot_threshold: 5_000,
            parser_early_terminate_packets: 32,
            parser_stride_confirm_hits: 3,
            read_retry_attempts: 3,
            read_retry_backoff_ms: 100,
            file_sweep_interval_secs: 60,
            feature_worker_threads: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.byte_cache_budget_bytes, 10 * 1024 * 1024);
        assert_eq!(c.max_open_files, 20);
        assert_eq!(c.idle_file_close_seconds, 300);
        assert_eq!(c.read_timeout_ms, 5_000);
        assert_eq!(c.snapshot_threshold, 10_000);
        assert_eq!(c.batch_snapshot_threshold, 5_000);
        assert_eq!(c.parser_early_terminate_packets, 32);
        assert_eq!(c.parser_stride_confirm_hits, 3);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let c: Config = serde_json::from_str(r#"{"max_open_files": 5}"#).unwrap();
        assert_eq!(c.max_open_files, 5);
        assert_eq!(c.read_timeout_ms, 5_000);
    }
}
