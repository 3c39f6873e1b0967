//! Connectivity tracking, the single-flight drain guard and the offline-aware write path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{DrainReport, Mutation, QueueResult, Replayer, SyncQueue};
use crate::api::ApiError;
use crate::store::LocalStore;

/// Shared online/offline flag for one device
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Update the flag; returns true when the device just came back online
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        online && !was_online
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain was in flight; nothing was sent
    AlreadyRunning,
}

/// Runs at most one drain at a time
pub struct Reconciler {
    queue: SyncQueue,
    replayer: Arc<dyn Replayer>,
    in_flight: Mutex<()>,
}

impl Reconciler {
    pub fn new(queue: SyncQueue, replayer: Arc<dyn Replayer>) -> Self {
        Self {
            queue,
            replayer,
            in_flight: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub async fn drain(&self) -> QueueResult<DrainOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Drain already in flight, skipping");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let report = self.queue.drain(self.replayer.as_ref()).await?;
        Ok(DrainOutcome::Completed(report))
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// The data API accepted the write
    Sent,
    /// Applied locally and queued for replay under this id
    Queued(u64),
    /// Applied locally but could not be queued; it will not reach the server
    Lost,
    /// The data API refused the write; nothing was queued
    Rejected(ApiError),
}

/// Write path that degrades to local apply plus queue when offline
pub struct OfflineWriter {
    store: LocalStore,
    queue: SyncQueue,
    remote: Arc<dyn Replayer>,
    connectivity: Connectivity,
}

impl OfflineWriter {
    /// `remote` sends straight to the data API; it is not the queue's replayer
    pub fn new(
        store: LocalStore,
        queue: SyncQueue,
        remote: Arc<dyn Replayer>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            connectivity,
        }
    }

    pub async fn write(&self, mutation: Mutation) -> WriteOutcome {
        if self.connectivity.is_online() {
            match self.remote.replay(&mutation).await {
                Ok(()) => {
                    self.apply_locally(&mutation);
                    return WriteOutcome::Sent;
                }
                Err(e) if e.is_transient() => {
                    warn!("Write to {}/{} failed, going offline: {}", mutation.table, mutation.key, e);
                    self.connectivity.set_online(false);
                }
                Err(e) => return WriteOutcome::Rejected(e),
            }
        }

        self.apply_locally(&mutation);
        match self.queue.enqueue(mutation) {
            Ok(entry) => WriteOutcome::Queued(entry.id),
            Err(e) => {
                warn!("Offline write could not be queued and is lost: {}", e);
                WriteOutcome::Lost
            }
        }
    }

    fn apply_locally(&self, mutation: &Mutation) {
        if let Err(e) = self.store.apply_local(mutation) {
            error!(
                "Failed to apply {:?} {}/{} locally: {}",
                mutation.action, mutation.table, mutation.key, e
            );
        }
    }
}
