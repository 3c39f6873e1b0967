//! Sled-backed log of pending mutations and the drain pass over it.

use packsync_shared::Collection;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{Mutation, QueueError, QueueResult, Replayer, SyncQueueEntry};
use crate::store::now_millis;

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl DrainReport {
    /// Whether the user should be told some changes are not synced yet
    pub fn needs_attention(&self) -> bool {
        self.failed > 0
    }
}

/// Persistent, timestamp-ordered log of offline mutations.
///
/// Rows are keyed by big-endian `(timestamp, id)` so plain tree iteration
/// yields ascending timestamp order, ties broken by enqueue order.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Db>,
    entries: Tree,
}

impl SyncQueue {
    pub(crate) fn new(db: Arc<Db>, entries: Tree) -> Self {
        Self { db, entries }
    }

    /// Record a mutation stamped with the current time
    pub fn enqueue(&self, mutation: Mutation) -> QueueResult<SyncQueueEntry> {
        self.enqueue_with_timestamp(mutation, now_millis())
    }

    pub fn enqueue_with_timestamp(
        &self,
        mutation: Mutation,
        timestamp: i64,
    ) -> QueueResult<SyncQueueEntry> {
        let entry = SyncQueueEntry {
            id: self.db.generate_id()?,
            mutation,
            timestamp,
        };

        self.entries
            .insert(entry_key(entry.timestamp, entry.id), serde_json::to_vec(&entry)?)?;
        debug!(
            "Queued {:?} {}/{} as #{}",
            entry.mutation.action, entry.mutation.table, entry.mutation.key, entry.id
        );
        Ok(entry)
    }

    /// Every pending entry in replay order
    pub fn pending(&self) -> QueueResult<Vec<SyncQueueEntry>> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (key, value) = item?;
            if key.len() != 16 {
                return Err(QueueError::CorruptKey(key.len()));
            }
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay every pending entry in order.
    ///
    /// A failing entry stays queued and does not stop the pass; only entries
    /// the replayer confirmed are removed. Once an entry fails, later entries
    /// for the same record are held back (and counted as failed) so the next
    /// pass still replays that record's writes oldest first.
    pub async fn drain(&self, replayer: &dyn Replayer) -> QueueResult<DrainReport> {
        let pending = self.pending()?;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(Collection, String)> = HashSet::new();

        if pending.is_empty() {
            return Ok(report);
        }

        info!("Draining {} queued mutations", pending.len());

        for entry in pending {
            let record = (entry.mutation.table, entry.mutation.key.clone());
            if blocked.contains(&record) {
                debug!(
                    "Holding back #{} behind an earlier failure on {}/{}",
                    entry.id, record.0, record.1
                );
                report.failed += 1;
                continue;
            }

            match replayer.replay(&entry.mutation).await {
                Ok(()) => match self.entries.remove(entry_key(entry.timestamp, entry.id)) {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        error!("Replayed #{} but could not remove it: {}", entry.id, e);
                        report.failed += 1;
                        blocked.insert(record);
                    }
                },
                Err(e) => {
                    warn!(
                        "Replay of #{} ({:?} {}/{}) failed: {}",
                        entry.id, entry.mutation.action, entry.mutation.table, entry.mutation.key, e
                    );
                    report.failed += 1;
                    blocked.insert(record);
                }
            }
        }

        info!(
            "Drain finished: {} succeeded, {} failed",
            report.succeeded, report.failed
        );
        Ok(report)
    }
}

fn entry_key(timestamp: i64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(timestamp.max(0) as u64).to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}
