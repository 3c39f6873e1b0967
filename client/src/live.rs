//! Live session against a trip's room broadcaster.
//!
//! The session keeps one WebSocket open per active trip, pings on an interval
//! and hands every `Changed` notification to a [`ChangeHandler`]. Missed
//! notifications are never replayed by the server, so every `Welcome` (first
//! connect and each reconnect) triggers a full resync.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use packsync_shared::protocol::ProtocolError;
use packsync_shared::{
    ChangeKind, ClientMessage, Collection, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::CachedApi;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Broadcaster base, e.g. `ws://127.0.0.1:5000`
    pub ws_url: String,
    pub trip_id: String,
    pub ping_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl LiveConfig {
    pub fn new(ws_url: impl Into<String>, trip_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            trip_id: trip_id.into(),
            ping_interval: Duration::from_secs(25),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/ws/{}", self.ws_url, self.trip_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { session_id: String },
}

/// Reacts to what the broadcaster reports
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_change(&self, trip_id: &str, kind: ChangeKind);

    /// Called after every (re)connect
    async fn on_resync(&self, trip_id: &str);
}

/// Refetches affected collections into the device store
pub struct Refresher {
    api: CachedApi,
}

impl Refresher {
    pub fn new(api: CachedApi) -> Self {
        Self { api }
    }

    async fn refresh_all(&self, trip_id: &str, collections: &[Collection]) {
        for collection in collections {
            if self.api.refresh(*collection, trip_id).await {
                warn!("Refresh of {} served from cache; data may be stale", collection);
            }
        }
    }
}

#[async_trait]
impl ChangeHandler for Refresher {
    async fn on_change(&self, trip_id: &str, kind: ChangeKind) {
        self.refresh_all(trip_id, kind.collections()).await;
    }

    async fn on_resync(&self, trip_id: &str) {
        self.refresh_all(trip_id, &Collection::ALL).await;
    }
}

enum SessionEnd {
    Cancelled,
    Dropped { welcomed: bool },
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct LiveSession {
    config: LiveConfig,
    handler: Arc<dyn ChangeHandler>,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl LiveSession {
    pub fn new(config: LiveConfig, handler: Arc<dyn ChangeHandler>) -> Self {
        Self {
            config,
            handler,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    /// Stay connected until `cancel` fires, reconnecting with capped backoff
    pub async fn run(&self, cancel: CancellationToken) {
        let endpoint = self.config.endpoint();
        let mut backoff = self.config.min_backoff;

        while !cancel.is_cancelled() {
            self.set_status(ConnectionStatus::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(endpoint.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    debug!("Connected to {}", endpoint);
                    match self.session(socket, &cancel).await {
                        Ok(SessionEnd::Cancelled) => break,
                        Ok(SessionEnd::Dropped { welcomed }) => {
                            info!("Live session for trip {} dropped", self.config.trip_id);
                            if welcomed {
                                backoff = self.config.min_backoff;
                            }
                        }
                        Err(e) => warn!("Live session for trip {} failed: {}", self.config.trip_id, e),
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", endpoint, e),
            }

            self.set_status(ConnectionStatus::Disconnected);
            debug!("Reconnecting in {:?}", backoff);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }

        self.set_status(ConnectionStatus::Disconnected);
        info!("Live session for trip {} stopped", self.config.trip_id);
    }

    async fn session(&self, socket: Socket, cancel: &CancellationToken) -> Result<SessionEnd, LiveError> {
        let (mut write, mut read) = socket.split();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        // The first tick completes immediately
        ping.tick().await;
        let mut welcomed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let goodbye = SyncProtocol::encode_client(&ClientMessage::Goodbye {
                        reason: Some("shutdown".to_string()),
                    })?;
                    let _ = write.send(Message::Binary(goodbye.to_vec())).await;
                    let _ = write.close().await;
                    return Ok(SessionEnd::Cancelled);
                }
                _ = ping.tick() => {
                    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    let frame = SyncProtocol::encode_client(&ClientMessage::Ping { timestamp })?;
                    write.send(Message::Binary(frame.to_vec())).await?;
                }
                msg = read.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(data))) => SyncProtocol::decode_server(&data),
                        Some(Ok(Message::Text(text))) => SyncProtocol::decode_server_text(&text),
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(SessionEnd::Dropped { welcomed });
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    match decoded {
                        Ok(message) => {
                            if self.dispatch(message).await {
                                welcomed = true;
                            }
                        }
                        Err(e) => warn!("Failed to decode server message: {}", e),
                    }
                }
            }
        }
    }

    /// Returns true for a `Welcome`
    async fn dispatch(&self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Welcome {
                protocol_version,
                session_id,
                ..
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "Server speaks protocol {}, expected {}",
                        protocol_version, PROTOCOL_VERSION
                    );
                }
                info!("Joined trip {} as session {}", self.config.trip_id, session_id);
                self.set_status(ConnectionStatus::Connected { session_id });
                self.handler.on_resync(&self.config.trip_id).await;
                true
            }
            ServerMessage::Changed { trip_id, kind, .. } => {
                if trip_id == self.config.trip_id {
                    debug!("Trip {} changed: {:?}", trip_id, kind);
                    self.handler.on_change(&trip_id, kind).await;
                } else {
                    warn!("Ignoring change for trip {} on session of {}", trip_id, self.config.trip_id);
                }
                false
            }
            ServerMessage::Pong { timestamp, .. } => {
                debug!("Pong for ping {}", timestamp);
                false
            }
        }
    }
}
