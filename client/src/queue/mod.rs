//! Offline mutation log and reconciliation.
//!
//! Writes that can't reach the server are applied to the local store and
//! appended here. Once the device is back online the log is drained in
//! ascending timestamp order, which makes the newest local write to a key the
//! one that lands on the server last.

mod pending;
mod reconcile;
mod replay;

pub use pending::{DrainReport, SyncQueue};
pub use reconcile::{Connectivity, DrainOutcome, OfflineWriter, Reconciler, WriteOutcome};
pub use replay::{AcknowledgingReplayer, HttpReplayer, Replayer};

use packsync_shared::Collection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by the sync queue itself, never by replay
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt queue key: {0} bytes")]
    CorruptKey(usize),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Put,
    Delete,
}

/// One write against a server collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: Collection,
    pub action: Action,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Mutation {
    pub fn put(table: Collection, key: impl Into<String>, payload: Value) -> Self {
        Self {
            table,
            action: Action::Put,
            key: key.into(),
            payload: Some(payload),
        }
    }

    pub fn delete(table: Collection, key: impl Into<String>) -> Self {
        Self {
            table,
            action: Action::Delete,
            key: key.into(),
            payload: None,
        }
    }
}

/// A pending mutation as persisted in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Assigned by the store on enqueue
    pub id: u64,
    #[serde(flatten)]
    pub mutation: Mutation,
    /// Milliseconds since epoch when the mutation was attempted
    pub timestamp: i64,
}
