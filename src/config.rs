//! Configuration for the partition transaction manager
//!
//! All tunables of the per-partition resource manager live here. The
//! defaults are safe for production; tests lower the intervals to keep
//! wall-clock time out of assertions.

use crate::error::{Result, WeirError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`PartitionTxManager`](crate::transaction::PartitionTxManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxManagerConfig {
    /// How long `sync` waits for the consensus layer to confirm leadership
    /// and catch up applies before giving up (ms).
    /// Default: 10000
    pub sync_timeout_ms: u64,

    /// Grace added on top of a transaction's own timeout before the
    /// auto-abort machinery considers it expired (ms).
    /// Default: 1000
    pub tx_timeout_delay_ms: u64,

    /// Tick interval of the auto-abort background loop (ms).
    /// Default: 60000
    pub abort_interval_ms: u64,

    /// Number of aborted transaction ranges kept in memory before they are
    /// offloaded to an on-disk abort segment.
    /// Default: 50000
    pub abort_index_segment_size: usize,

    /// Interval between periodic transaction-statistics log lines (ms).
    /// Default: 30000
    pub log_stats_interval_ms: u64,

    /// Whether expired transactions are aborted automatically.
    /// Default: true
    pub is_autoabort_enabled: bool,

    /// Whether the cluster-wide transaction partitioning feature is active.
    /// Controls which fence-batch and snapshot versions are written
    /// (v2/v4 when active, v1/v3 otherwise).
    /// Default: true
    pub transaction_partitioning: bool,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 10_000,
            tx_timeout_delay_ms: 1_000,
            abort_interval_ms: 60_000,
            abort_index_segment_size: 50_000,
            log_stats_interval_ms: 30_000,
            is_autoabort_enabled: true,
            transaction_partitioning: true,
        }
    }
}

impl TxManagerConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(data: &str) -> Result<Self> {
        let cfg: TxManagerConfig = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.sync_timeout_ms == 0 {
            return Err(WeirError::Config("sync_timeout_ms must be > 0".into()));
        }
        if self.abort_index_segment_size == 0 {
            return Err(WeirError::Config(
                "abort_index_segment_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn tx_timeout_delay(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_delay_ms)
    }

    pub fn abort_interval(&self) -> Duration {
        Duration::from_millis(self.abort_interval_ms)
    }

    pub fn log_stats_interval(&self) -> Duration {
        Duration::from_millis(self.log_stats_interval_ms)
    }
}
