//! Sled-based implementation of the device store.
//!
//! Tree layout:
//! - One tree per [`Collection`], named after the collection's table name
//! - `sync_queue`: pending offline mutations (see [`crate::queue`])
//!
//! Trip-scoped collections key rows as `<trip_id> 0x00 <id>` so a whole trip can be
//! listed or purged with a single prefix scan.

use packsync_shared::{
    Category, Collection, EquipmentItem, MainCategory, PackingEntry, Record, Tag, Traveler, Trip,
    Vehicle,
};
use serde::Deserialize;
use serde_json::Value;
use sled::{Batch, Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{now_millis, CachedRecord, StoreConfig};
use crate::queue::{Action, Mutation, SyncQueue};

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store initialization failed: {0}")]
    InitFailed(String),

    #[error("Record {key} in {collection} has no trip id")]
    MissingPartition { collection: Collection, key: String },

    #[error("Payload for {collection}/{key} is not a valid record: {reason}")]
    InvalidRecord {
        collection: Collection,
        key: String,
        reason: String,
    },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

const TREE_SYNC_QUEUE: &str = "sync_queue";
const PARTITION_SEPARATOR: u8 = 0x00;

/// Persistent mirror of the server collections on one device
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Db>,
}

impl LocalStore {
    /// Open or create a store at the configured path
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
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

        // Touch every tree up front so a fresh device reads empty collections
        for collection in Collection::ALL {
            db.open_tree(collection.as_str())?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    /// The offline mutation log, co-located in the same database
    pub fn sync_queue(&self) -> StoreResult<SyncQueue> {
        let tree = self.db.open_tree(TREE_SYNC_QUEUE)?;
        Ok(SyncQueue::new(self.db.clone(), tree))
    }

    fn tree(&self, collection: Collection) -> StoreResult<Tree> {
        Ok(self.db.open_tree(collection.as_str())?)
    }

    // ========================================================================
    // Cache writes
    // ========================================================================

    /// Upsert a batch of freshly fetched records.
    ///
    /// The whole batch becomes visible at once; existing copies are overwritten.
    pub fn cache_records<T: Record>(&self, records: &[T]) -> StoreResult<usize> {
        let tree = self.tree(T::COLLECTION)?;
        let now = now_millis();
        let mut batch = Batch::default();

        for record in records {
            let key = record_key(record)?;
            let envelope = CachedRecord::fetched(record, now);
            batch.insert(key, serde_json::to_vec(&envelope)?);
        }

        tree.apply_batch(batch)?;
        debug!("Cached {} {} records", records.len(), T::COLLECTION);
        Ok(records.len())
    }

    /// Replace every cached record of one trip with the given full set.
    ///
    /// Rows that belong to a different trip are skipped.
    pub fn replace_trip_entries<T: Record>(&self, trip_id: &str, records: &[T]) -> StoreResult<usize> {
        let tree = self.tree(T::COLLECTION)?;
        let now = now_millis();
        let mut batch = Batch::default();

        for item in tree.scan_prefix(trip_prefix(trip_id)) {
            let (key, _) = item?;
            batch.remove(key);
        }

        let mut written = 0;
        for record in records {
            if record.partition() != Some(trip_id) {
                warn!(
                    "Skipping {} record {} returned for trip {}",
                    T::COLLECTION,
                    record.key(),
                    trip_id
                );
                continue;
            }
            let envelope = CachedRecord::fetched(record, now);
            batch.insert(record_key(record)?, serde_json::to_vec(&envelope)?);
            written += 1;
        }

        tree.apply_batch(batch)?;
        debug!("Replaced {} {} records for trip {}", written, T::COLLECTION, trip_id);
        Ok(written)
    }

    // ========================================================================
    // Cache reads
    // ========================================================================

    /// Every cached record of a collection, envelope stripped
    pub fn read_all<T: Record>(&self) -> StoreResult<Vec<T>> {
        let tree = self.tree(T::COLLECTION)?;
        decode_rows(tree.iter())
    }

    /// Cached records of one trip, envelope stripped
    pub fn read_trip_entries<T: Record>(&self, trip_id: &str) -> StoreResult<Vec<T>> {
        let tree = self.tree(T::COLLECTION)?;
        decode_rows(tree.scan_prefix(trip_prefix(trip_id)))
    }

    /// The full envelope for one record, for inspecting cache timestamps
    pub fn envelope<T: Record>(
        &self,
        trip_id: Option<&str>,
        key: &str,
    ) -> StoreResult<Option<CachedRecord<T>>> {
        let tree = self.tree(T::COLLECTION)?;
        let row_key = match trip_id {
            Some(trip_id) => scoped_key(trip_id, key),
            None => key.as_bytes().to_vec(),
        };
        match tree.get(row_key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Optimistic local writes
    // ========================================================================

    /// Apply a mutation to the local copy before the server has seen it.
    ///
    /// A put must carry a complete record of the collection whose id matches
    /// the mutation key; anything else is refused with
    /// [`StoreError::InvalidRecord`] and leaves the store untouched. A put
    /// keeps the existing `cached_at` and moves `updated_at` to now. Moving a
    /// trip-scoped record to another trip drops its row under the old trip.
    pub fn apply_local(&self, mutation: &Mutation) -> StoreResult<()> {
        let collection = mutation.table;
        let tree = self.tree(collection)?;

        match mutation.action {
            Action::Put => {
                let record = mutation.payload.clone().ok_or_else(|| StoreError::InvalidRecord {
                    collection,
                    key: mutation.key.clone(),
                    reason: "missing payload".to_string(),
                })?;
                let partition = validate_payload(collection, &mutation.key, &record)?;
                let row_key = match &partition {
                    Some(trip_id) => scoped_key(trip_id, &mutation.key),
                    None => mutation.key.as_bytes().to_vec(),
                };

                let mut batch = Batch::default();
                let mut previous = None;
                if collection.is_trip_scoped() {
                    for item in tree.iter() {
                        let (existing, value) = item?;
                        if scoped_id(&existing) != Some(mutation.key.as_bytes()) {
                            continue;
                        }
                        if previous.is_none() {
                            previous = Some(value);
                        }
                        if existing.as_ref() != row_key.as_slice() {
                            batch.remove(existing);
                        }
                    }
                } else {
                    previous = tree.get(&row_key)?;
                }

                let now = now_millis();
                let cached_at = match previous {
                    Some(bytes) => serde_json::from_slice::<CachedRecord<Value>>(&bytes)
                        .map(|envelope| envelope.cached_at)
                        .unwrap_or(now),
                    None => now,
                };
                let envelope = CachedRecord {
                    record,
                    cached_at,
                    updated_at: now,
                };
                batch.insert(row_key, serde_json::to_vec(&envelope)?);
                tree.apply_batch(batch)?;
            }
            Action::Delete => {
                if collection.is_trip_scoped() {
                    let mut batch = Batch::default();
                    for item in tree.iter() {
                        let (row_key, _) = item?;
                        if scoped_id(&row_key) == Some(mutation.key.as_bytes()) {
                            batch.remove(row_key);
                        }
                    }
                    tree.apply_batch(batch)?;
                } else {
                    tree.remove(mutation.key.as_bytes())?;
                }
            }
        }

        debug!("Applied local {:?} to {}/{}", mutation.action, collection, mutation.key);
        Ok(())
    }

    /// Drop every cached row belonging to a trip
    pub fn purge_trip(&self, trip_id: &str) -> StoreResult<usize> {
        let mut removed = 0;

        for collection in Collection::ALL.into_iter().filter(|c| c.is_trip_scoped()) {
            let tree = self.tree(collection)?;
            let mut batch = Batch::default();
            for item in tree.scan_prefix(trip_prefix(trip_id)) {
                let (key, _) = item?;
                batch.remove(key);
                removed += 1;
            }
            tree.apply_batch(batch)?;
        }

        Ok(removed)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let mut cached_records = 0;
        for collection in Collection::ALL {
            cached_records += self.tree(collection)?.len();
        }

        Ok(StoreStats {
            cached_records,
            pending_mutations: self.db.open_tree(TREE_SYNC_QUEUE)?.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        })
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if Arc::strong_count(&self.db) == 1 {
            if let Err(e) = self.db.flush() {
                tracing::error!("Failed to flush device store on drop: {}", e);
            }
        }
    }
}

/// Check a raw payload decodes as the collection's record; returns its trip
fn validate_payload(collection: Collection, key: &str, payload: &Value) -> StoreResult<Option<String>> {
    match collection {
        Collection::Trips => check_payload::<Trip>(key, payload),
        Collection::Equipment => check_payload::<EquipmentItem>(key, payload),
        Collection::Categories => check_payload::<Category>(key, payload),
        Collection::MainCategories => check_payload::<MainCategory>(key, payload),
        Collection::Tags => check_payload::<Tag>(key, payload),
        Collection::Travelers => check_payload::<Traveler>(key, payload),
        Collection::Vehicles => check_payload::<Vehicle>(key, payload),
        Collection::PackingEntries => check_payload::<PackingEntry>(key, payload),
    }
}

fn check_payload<T: Record>(key: &str, payload: &Value) -> StoreResult<Option<String>> {
    let invalid = |reason: String| StoreError::InvalidRecord {
        collection: T::COLLECTION,
        key: key.to_string(),
        reason,
    };

    let record = T::deserialize(payload).map_err(|e| invalid(e.to_string()))?;
    if record.key() != key {
        return Err(invalid(format!("payload id {} does not match", record.key())));
    }
    Ok(record.partition().map(str::to_string))
}

fn record_key<T: Record>(record: &T) -> StoreResult<Vec<u8>> {
    if T::COLLECTION.is_trip_scoped() {
        let trip_id = record.partition().ok_or_else(|| StoreError::MissingPartition {
            collection: T::COLLECTION,
            key: record.key().to_string(),
        })?;
        Ok(scoped_key(trip_id, record.key()))
    } else {
        Ok(record.key().as_bytes().to_vec())
    }
}

fn trip_prefix(trip_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(trip_id.len() + 1);
    prefix.extend_from_slice(trip_id.as_bytes());
    prefix.push(PARTITION_SEPARATOR);
    prefix
}

fn scoped_key(trip_id: &str, id: &str) -> Vec<u8> {
    let mut key = trip_prefix(trip_id);
    key.extend_from_slice(id.as_bytes());
    key
}

fn scoped_id(row_key: &[u8]) -> Option<&[u8]> {
    let split = row_key.iter().position(|b| *b == PARTITION_SEPARATOR)?;
    Some(&row_key[split + 1..])
}

fn decode_rows<T, I>(rows: I) -> StoreResult<Vec<T>>
where
    T: Record,
    I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
{
    let mut records = Vec::new();
    for item in rows {
        let (key, value) = item?;
        match serde_json::from_slice::<CachedRecord<T>>(&value) {
            Ok(envelope) => records.push(envelope.into_record()),
            Err(e) => warn!(
                "Skipping undecodable {} row {}: {}",
                T::COLLECTION,
                String::from_utf8_lossy(&key),
                e
            ),
        }
    }
    Ok(records)
}

/// Statistics about the device store
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub cached_records: usize,
    pub pending_mutations: usize,
    pub total_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use packsync_shared::{PackingEntry, Tag};
    use serde_json::json;
    use tempfile::tempdir;

    fn create_test_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("device.sled").to_string_lossy());
        let store = LocalStore::open(config).unwrap();
        (dir, store)
    }

    fn tag(id: &str, name: &str) -> Tag {
        Tag {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn entry(id: &str, trip_id: &str, packed: bool) -> PackingEntry {
        PackingEntry {
            id: id.to_string(),
            trip_id: trip_id.to_string(),
            equipment_id: format!("eq-{}", id),
            traveler_id: None,
            quantity: 1,
            packed,
        }
    }

    #[test]
    fn test_empty_collection_reads_empty() {
        let (_dir, store) = create_test_store();
        let tags: Vec<Tag> = store.read_all().unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn test_caching_twice_is_idempotent() {
        let (_dir, store) = create_test_store();
        let batch = vec![tag("t1", "Winter"), tag("t2", "Camping")];

        store.cache_records(&batch).unwrap();
        let first = store.envelope::<Tag>(None, "t1").unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.cache_records(&batch).unwrap();

        let mut tags: Vec<Tag> = store.read_all().unwrap();
        tags.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(tags, batch);

        let second = store.envelope::<Tag>(None, "t1").unwrap().unwrap();
        assert!(second.cached_at > first.cached_at);
    }

    #[test]
    fn test_replace_trip_entries_drops_server_deletions() {
        let (_dir, store) = create_test_store();
        store
            .replace_trip_entries("trip-1", &[entry("a", "trip-1", false), entry("b", "trip-1", false)])
            .unwrap();
        store
            .replace_trip_entries("trip-2", &[entry("c", "trip-2", false)])
            .unwrap();

        let written = store
            .replace_trip_entries("trip-1", &[entry("b", "trip-1", true)])
            .unwrap();
        assert_eq!(written, 1);

        let trip_one: Vec<PackingEntry> = store.read_trip_entries("trip-1").unwrap();
        assert_eq!(trip_one, vec![entry("b", "trip-1", true)]);

        let trip_two: Vec<PackingEntry> = store.read_trip_entries("trip-2").unwrap();
        assert_eq!(trip_two.len(), 1);
    }

    #[test]
    fn test_replace_skips_entries_of_other_trips() {
        let (_dir, store) = create_test_store();
        let written = store
            .replace_trip_entries("trip-1", &[entry("a", "trip-1", false), entry("x", "trip-9", false)])
            .unwrap();

        assert_eq!(written, 1);
        assert!(store.read_trip_entries::<PackingEntry>("trip-9").unwrap().is_empty());
    }

    #[test]
    fn test_trip_prefix_does_not_leak_into_longer_ids() {
        let (_dir, store) = create_test_store();
        store.replace_trip_entries("trip-1", &[entry("a", "trip-1", false)]).unwrap();
        store.replace_trip_entries("trip-10", &[entry("b", "trip-10", false)]).unwrap();

        let entries: Vec<PackingEntry> = store.read_trip_entries("trip-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }

    #[test]
    fn test_apply_local_put_keeps_cached_at() {
        let (_dir, store) = create_test_store();
        store.cache_records(&[tag("t1", "Winter")]).unwrap();
        let before = store.envelope::<Tag>(None, "t1").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .apply_local(&Mutation::put(
                Collection::Tags,
                "t1",
                json!({"id": "t1", "name": "Snow"}),
            ))
            .unwrap();

        let after = store.envelope::<Tag>(None, "t1").unwrap().unwrap();
        assert_eq!(after.record.name, "Snow");
        assert_eq!(after.cached_at, before.cached_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[test]
    fn test_apply_local_delete_of_trip_entry() {
        let (_dir, store) = create_test_store();
        store
            .replace_trip_entries("trip-1", &[entry("a", "trip-1", false), entry("b", "trip-1", false)])
            .unwrap();

        store
            .apply_local(&Mutation::delete(Collection::PackingEntries, "a"))
            .unwrap();

        let entries: Vec<PackingEntry> = store.read_trip_entries("trip-1").unwrap();
        assert_eq!(entries, vec![entry("b", "trip-1", false)]);
    }

    #[test]
    fn test_apply_local_put_entry_needs_trip_id() {
        let (_dir, store) = create_test_store();
        let result = store.apply_local(&Mutation::put(
            Collection::PackingEntries,
            "a",
            json!({"id": "a", "equipmentId": "eq"}),
        ));
        assert!(matches!(result, Err(StoreError::InvalidRecord { .. })));
        assert!(store.read_all::<PackingEntry>().unwrap().is_empty());
    }

    #[test]
    fn test_partial_put_is_refused_and_cache_stays_readable() {
        let (_dir, store) = create_test_store();
        store.cache_records(&[tag("t1", "Winter"), tag("t2", "Beach")]).unwrap();

        let result = store.apply_local(&Mutation::put(Collection::Tags, "t1", json!({"name": "Snow"})));
        assert!(matches!(
            result,
            Err(StoreError::InvalidRecord { collection: Collection::Tags, .. })
        ));

        let mut tags: Vec<Tag> = store.read_all().unwrap();
        tags.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(tags, vec![tag("t1", "Winter"), tag("t2", "Beach")]);
    }

    #[test]
    fn test_put_with_mismatched_id_is_refused() {
        let (_dir, store) = create_test_store();
        let result = store.apply_local(&Mutation::put(
            Collection::Tags,
            "t1",
            json!({"id": "t2", "name": "Snow"}),
        ));
        assert!(matches!(result, Err(StoreError::InvalidRecord { .. })));
        assert!(store.read_all::<Tag>().unwrap().is_empty());
    }

    #[test]
    fn test_undecodable_row_is_skipped_on_read() {
        let (_dir, store) = create_test_store();
        store.cache_records(&[tag("t1", "Winter"), tag("t2", "Beach")]).unwrap();
        store
            .tree(Collection::Tags)
            .unwrap()
            .insert("t3", br#"{"record":{"name":"Snow"},"cachedAt":1,"updatedAt":1}"#.to_vec())
            .unwrap();

        let tags: Vec<Tag> = store.read_all().unwrap();
        assert_eq!(tags.len(), 2);
        assert!(tags.iter().all(|t| t.id != "t3"));
    }

    #[test]
    fn test_moving_entry_to_another_trip_drops_old_row() {
        let (_dir, store) = create_test_store();
        store
            .replace_trip_entries("trip-1", &[entry("a", "trip-1", false), entry("b", "trip-1", false)])
            .unwrap();
        let before = store.envelope::<PackingEntry>(Some("trip-1"), "a").unwrap().unwrap();

        let moved = entry("a", "trip-2", true);
        store
            .apply_local(&Mutation::put(
                Collection::PackingEntries,
                "a",
                serde_json::to_value(&moved).unwrap(),
            ))
            .unwrap();

        let trip_one: Vec<PackingEntry> = store.read_trip_entries("trip-1").unwrap();
        assert_eq!(trip_one, vec![entry("b", "trip-1", false)]);
        let trip_two: Vec<PackingEntry> = store.read_trip_entries("trip-2").unwrap();
        assert_eq!(trip_two, vec![moved]);

        let after = store.envelope::<PackingEntry>(Some("trip-2"), "a").unwrap().unwrap();
        assert_eq!(after.cached_at, before.cached_at);
    }

    #[test]
    fn test_purge_trip() {
        let (_dir, store) = create_test_store();
        store.replace_trip_entries("trip-1", &[entry("a", "trip-1", false)]).unwrap();
        store.cache_records(&[tag("t1", "Winter")]).unwrap();

        assert_eq!(store.purge_trip("trip-1").unwrap(), 1);
        assert!(store.read_trip_entries::<PackingEntry>("trip-1").unwrap().is_empty());
        assert_eq!(store.read_all::<Tag>().unwrap().len(), 1);
    }

    #[test]
    fn test_stats_counts_rows_and_queue() {
        let (_dir, store) = create_test_store();
        store.cache_records(&[tag("t1", "Winter"), tag("t2", "Beach")]).unwrap();
        store
            .sync_queue()
            .unwrap()
            .enqueue(Mutation::delete(Collection::Tags, "t2"))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.cached_records, 2);
        assert_eq!(stats.pending_mutations, 1);
    }
}
