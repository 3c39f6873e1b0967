//! Sled-based storage implementation for the route cache.
//!
//! Keys are `<user_id>:<destination_id>`; values are bincode-encoded
//! [`RouteCacheEntry`] rows. Invalidation by destination or by user compares
//! the decoded row rather than parsing keys, so ids containing `:` stay safe.

use sled::{Batch, Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{RouteCacheEntry, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_ROUTE_CACHE: &str = "route_cache";

/// Sled-backed store for route cache rows
#[derive(Clone)]
pub struct RouteCacheStore {
    db: Arc<Db>,
    routes: Tree,
}

impl RouteCacheStore {
    /// Open or create a route cache at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let routes = db.open_tree(TREE_ROUTE_CACHE)?;

        Ok(Self {
            db: Arc::new(db),
            routes,
        })
    }

    /// Look up the cached route for a pair
    pub fn get(&self, user_id: &str, destination_id: &str) -> StorageResult<Option<RouteCacheEntry>> {
        match self.routes.get(pair_key(user_id, destination_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a route, overwriting any previous row for the same pair
    pub fn put(&self, entry: &RouteCacheEntry) -> StorageResult<()> {
        let bytes = bincode::serialize(entry)?;
        self.routes
            .insert(pair_key(&entry.user_id, &entry.destination_id), bytes)?;
        Ok(())
    }

    /// Remove the row for one pair; returns whether a row existed
    pub fn invalidate(&self, user_id: &str, destination_id: &str) -> StorageResult<bool> {
        Ok(self
            .routes
            .remove(pair_key(user_id, destination_id))?
            .is_some())
    }

    /// Remove every row leading to a destination (its coordinates changed)
    pub fn invalidate_destination(&self, destination_id: &str) -> StorageResult<usize> {
        self.remove_where(|entry| entry.destination_id == destination_id)
    }

    /// Remove every row starting at a traveler's home (their address changed)
    pub fn invalidate_user(&self, user_id: &str) -> StorageResult<usize> {
        self.remove_where(|entry| entry.user_id == user_id)
    }

    fn remove_where<F>(&self, predicate: F) -> StorageResult<usize>
    where
        F: Fn(&RouteCacheEntry) -> bool,
    {
        let mut batch = Batch::default();
        let mut removed = 0;

        for item in self.routes.iter() {
            let (key, value) = item?;
            let entry: RouteCacheEntry = bincode::deserialize(&value)?;
            if predicate(&entry) {
                batch.remove(key);
                removed += 1;
            }
        }

        self.routes.apply_batch(batch)?;
        Ok(removed)
    }

    /// Number of cached pairs
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            route_count: self.routes.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

fn pair_key(user_id: &str, destination_id: &str) -> Vec<u8> {
    format!("{}:{}", user_id, destination_id).into_bytes()
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub route_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for RouteCacheStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
