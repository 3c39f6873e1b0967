//! Change notifications issued after a mutation commits.
//!
//! The mutation layer never waits on delivery: [`after_commit`] hands the
//! notification to a detached task and returns the mutation result untouched,
//! so a broken broadcaster can't fail a write that already succeeded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use packsync_shared::ChangeKind;

use crate::broadcast::{NotifyAck, RoomRegistry};

/// Errors that can occur while asking a broadcaster to notify
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broadcaster unavailable: {0}")]
    Unavailable(String),
}

/// Body of a server-to-server notify call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    #[serde(default = "default_kind")]
    pub kind: ChangeKind,
}

fn default_kind() -> ChangeKind {
    ChangeKind::PackingListChanged
}

/// Anything that can deliver a change notification to a trip's room
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, trip_id: &str, kind: ChangeKind) -> Result<NotifyAck, NotifyError>;
}

#[async_trait]
impl ChangeNotifier for RoomRegistry {
    async fn notify(&self, trip_id: &str, kind: ChangeKind) -> Result<NotifyAck, NotifyError> {
        Ok(RoomRegistry::notify(self, trip_id, kind).await)
    }
}

/// Notifier for mutation handlers running in a different process than the broadcaster
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChangeNotifier for HttpNotifier {
    async fn notify(&self, trip_id: &str, kind: ChangeKind) -> Result<NotifyAck, NotifyError> {
        let url = format!("{}/api/trips/{}/notify", self.base_url, trip_id);
        let ack = self
            .client
            .post(&url)
            .json(&NotifyRequest { kind })
            .send()
            .await?
            .error_for_status()?
            .json::<NotifyAck>()
            .await?;
        Ok(ack)
    }
}

/// Fire a notification on a detached task; failures are logged and dropped
pub fn spawn_notify(
    notifier: Arc<dyn ChangeNotifier>,
    trip_id: impl Into<String>,
    kind: ChangeKind,
) -> JoinHandle<()> {
    let trip_id = trip_id.into();
    tokio::spawn(async move {
        match notifier.notify(&trip_id, kind).await {
            Ok(ack) => debug!(
                "Notified trip {} of {:?}: {} delivered, {} failed",
                trip_id, kind, ack.delivered, ack.failed
            ),
            Err(e) => warn!("Failed to notify trip {} of {:?}: {}", trip_id, kind, e),
        }
    })
}

/// Pass a mutation result through, scheduling a notification only on success
pub fn after_commit<T, E>(
    result: Result<T, E>,
    notifier: &Arc<dyn ChangeNotifier>,
    trip_id: &str,
    kind: ChangeKind,
) -> Result<T, E> {
    if result.is_ok() {
        spawn_notify(notifier.clone(), trip_id, kind);
    }
    result
}
