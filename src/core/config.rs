use std::path::PathBuf;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage_path: PathBuf,
    pub block_size: usize,

    // Block cache bounds, per open file
    pub cache_max_entries: usize,
    pub cache_max_age_secs: u64,
    pub cache_sweep_interval_secs: u64,

    /// Inline payload limit before a record is promoted to a BLOB chain.
    /// `None` derives the limit from the block size at file open time.
    pub record_size_limit: Option<usize>,

    /// Upper bound on waiting for a collection writer lock.
    pub lock_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: PathBuf::from("./data"),
            block_size: 16 * 1024,             // 16KB blocks

            cache_max_entries: 1000,           // ~16MB cached per file
            cache_max_age_secs: 300,           // drop blocks idle for 5 minutes
            cache_sweep_interval_secs: 30,

            record_size_limit: None,           // derived: block_size / 4
            lock_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Effective inline record limit for a file opened with `block_size`.
    pub fn effective_record_limit(&self) -> usize {
        self.record_size_limit
            .unwrap_or(self.block_size / 4)
            .min(self.block_size / 2)
    }
}
