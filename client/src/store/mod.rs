//! Local durable store mirroring server collections on the device.
//!
//! Every read path can answer from here when the network is gone. Records are
//! stored inside a [`CachedRecord`] envelope that carries the bookkeeping
//! timestamps; reads strip the envelope so callers only ever see pure records.

mod sled_store;

pub use sled_store::{LocalStore, StoreError, StoreResult, StoreStats};

use serde::{Deserialize, Serialize};

/// A domain record wrapped with cache bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord<T> {
    pub record: T,
    /// Milliseconds since epoch of the last fetch-and-store
    pub cached_at: i64,
    /// Milliseconds since epoch of the last local mutation of this copy
    pub updated_at: i64,
}

impl<T> CachedRecord<T> {
    /// Wrap a freshly fetched record
    pub fn fetched(record: T, now: i64) -> Self {
        Self {
            record,
            cached_at: now,
            updated_at: now,
        }
    }

    pub fn into_record(self) -> T {
        self.record
    }
}

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 16MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./data/device.sled".to_string(),
            cache_size: 16 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StoreConfig {
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

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
