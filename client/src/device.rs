//! One device's sync stack, wired from a [`ClientConfig`].

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::api::{ApiError, CachedApi, HttpDataApi};
use crate::config::{ClientConfig, ConfigError};
use crate::live::{LiveConfig, LiveSession, Refresher};
use crate::queue::{
    Connectivity, DrainOutcome, HttpReplayer, OfflineWriter, QueueError, Reconciler, SyncQueue,
};
use crate::routes::RouteClient;
use crate::store::{LocalStore, StoreError};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

pub struct Device {
    config: ClientConfig,
    api: CachedApi,
    queue: SyncQueue,
    connectivity: Connectivity,
    writer: OfflineWriter,
    reconciler: Reconciler,
    routes: RouteClient,
}

impl Device {
    pub fn open(config: ClientConfig) -> Result<Self, DeviceError> {
        let store = LocalStore::open(config.store.clone())?;
        let queue = store.sync_queue()?;
        let http = Arc::new(HttpDataApi::new(config.api_url.clone(), config.http_timeout)?);
        // Online writes always hit the data API; only queue replay follows `replay_mode`
        let direct = Arc::new(HttpReplayer::new(http.clone()));
        let replayer = config.replayer(http.clone());
        let connectivity = Connectivity::default();

        info!(
            "Device store at {} with {} pending mutations ({:?} replay)",
            config.store.path,
            queue.len(),
            config.replay_mode
        );

        Ok(Self {
            api: CachedApi::new(http.clone(), store.clone()),
            writer: OfflineWriter::new(store, queue.clone(), direct, connectivity.clone()),
            reconciler: Reconciler::new(queue.clone(), replayer),
            routes: RouteClient::new(config.api_url.clone(), config.http_timeout)?,
            queue,
            connectivity,
            config,
        })
    }

    pub fn api(&self) -> &CachedApi {
        &self.api
    }

    pub fn store(&self) -> &LocalStore {
        self.api.store()
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn writer(&self) -> &OfflineWriter {
        &self.writer
    }

    pub fn routes(&self) -> &RouteClient {
        &self.routes
    }

    /// Record a connectivity change, draining the queue when the device comes back
    pub async fn set_online(&self, online: bool) -> Result<Option<DrainOutcome>, DeviceError> {
        if self.connectivity.set_online(online) {
            return Ok(Some(self.reconciler.drain().await?));
        }
        Ok(None)
    }

    pub async fn drain(&self) -> Result<DrainOutcome, DeviceError> {
        Ok(self.reconciler.drain().await?)
    }

    /// A live session for `trip_id` that refreshes this device's store
    pub fn live_session(&self, trip_id: &str) -> LiveSession {
        let config = LiveConfig::new(self.config.ws_url.clone(), trip_id)
            .with_ping_interval(self.config.ping_interval);
        LiveSession::new(config, Arc::new(Refresher::new(self.api.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayMode;
    use crate::queue::{DrainReport, Mutation, WriteOutcome};
    use crate::store::StoreConfig;
    use axum::http::StatusCode;
    use axum::routing::put;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use packsync_shared::{Collection, Tag};
    use serde_json::json;
    use tempfile::tempdir;

    fn open_device(dir: &tempfile::TempDir) -> Device {
        open_device_at(dir, "http://127.0.0.1:9")
    }

    fn open_device_at(dir: &tempfile::TempDir, api_url: &str) -> Device {
        let config = ClientConfig {
            api_url: api_url.to_string(),
            store: StoreConfig::new(dir.path().join("device.sled").to_string_lossy())
                .with_flush_interval(0),
            ..Default::default()
        };
        Device::open(config).unwrap()
    }

    async fn spawn_counting_data_api(puts: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/api/:table/:key",
            put(move || {
                let puts = puts.clone();
                async move {
                    puts.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_online_write_reaches_data_api_in_stub_replay_mode() {
        let dir = tempdir().unwrap();
        let puts = Arc::new(AtomicUsize::new(0));
        let base = spawn_counting_data_api(puts.clone()).await;
        let device = open_device_at(&dir, &base);
        assert_eq!(device.config.replay_mode, ReplayMode::Stub);

        let outcome = device
            .writer()
            .write(Mutation::put(Collection::Tags, "t1", json!({"id": "t1", "name": "Snow"})))
            .await;

        assert!(matches!(outcome, WriteOutcome::Sent));
        assert_eq!(puts.load(Ordering::SeqCst), 1);
        assert!(device.queue().is_empty());
    }

    #[tokio::test]
    async fn test_coming_online_drains_offline_writes() {
        let dir = tempdir().unwrap();
        let device = open_device(&dir);
        device.connectivity().set_online(false);

        let outcome = device
            .writer()
            .write(Mutation::put(Collection::Tags, "t1", json!({"id": "t1", "name": "Snow"})))
            .await;
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(device.store().read_all::<Tag>().unwrap().len(), 1);

        let drained = device.set_online(true).await.unwrap();
        assert_eq!(
            drained,
            Some(DrainOutcome::Completed(DrainReport { succeeded: 1, failed: 0 }))
        );
        assert!(device.queue().is_empty());

        // Already online: nothing to do
        assert_eq!(device.set_online(true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let device = open_device(&dir);
            device.connectivity().set_online(false);
            device
                .writer()
                .write(Mutation::delete(Collection::Vehicles, "v1"))
                .await;
            device.store().flush().unwrap();
        }

        let device = open_device(&dir);
        assert_eq!(device.queue().len(), 1);
    }
}
