//! Storage module for the server-side route cache using Sled.
//!
//! One row per (traveler, destination) pair holds the last computed route
//! estimate. Rows are bincode-encoded and only ever written by the route
//! resolver; the mutation layer deletes them when coordinates change.

mod sled_store;

pub use sled_store::{RouteCacheStore, StorageError, StorageResult, StorageStats};

pub use packsync_shared::RouteCacheEntry;

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/packsync.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}
