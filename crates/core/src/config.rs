//! Configuration knobs

use serde::{Deserialize, Serialize};

/// Tuning for the row cache and its update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget of the cache region; `None` disables eviction pressure.
    pub memory_budget: Option<usize>,
    /// Memtable entries folded into the cache per allocating section.
    pub update_batch_quota: usize,
    /// Versions freed by the cleaner per worker tick.
    pub cleaner_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            memory_budget: None,
            update_batch_quota: 30,
            cleaner_batch: 32,
        }
    }
}

/// Size thresholds above which partitions, rows and cells are reported to
/// the large-data sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LargeDataThresholds {
    /// Partition size threshold in bytes.
    pub partition_bytes: u64,
    /// Row size threshold in bytes.
    pub row_bytes: u64,
    /// Cell size threshold in bytes.
    pub cell_bytes: u64,
}

impl Default for LargeDataThresholds {
    fn default() -> Self {
        LargeDataThresholds {
            partition_bytes: u64::MAX,
            row_bytes: u64::MAX,
            cell_bytes: u64::MAX,
        }
    }
}
