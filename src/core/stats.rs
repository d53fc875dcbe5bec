use std::time::SystemTime;
use serde::{Serialize, Deserialize};
use crate::storage::cache::CacheStats;

/// Engine-wide statistics for monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub start_time: SystemTime,

    pub collection_count: usize,
    pub collections: Vec<CollectionStats>,
}

/// Per-collection storage metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub object_count: usize,
    pub index_count: usize,
    pub block_count: u32,
    pub free_blocks: u64,
    pub cache: CacheStats,
}
