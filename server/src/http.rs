//! HTTP and WebSocket surface of the server.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use packsync_shared::{ClientMessage, ServerMessage, SyncProtocol, PROTOCOL_VERSION};

use crate::broadcast::{NotifyAck, RoomRegistry, SessionHandle, SessionState};
use crate::config::ServerConfig;
use crate::notify::NotifyRequest;
use crate::routes::{RouteRequest, RouteResolver};
use crate::storage::RouteCacheStore;

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// One broadcaster per trip
    pub rooms: Arc<RoomRegistry>,
    /// Route estimates with their persistent cache
    pub routes: Arc<RouteResolver>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(rooms: Arc<RoomRegistry>, routes: Arc<RouteResolver>) -> Self {
        Self {
            rooms,
            routes,
            started_at: std::time::Instant::now(),
        }
    }

    /// Open storage and build every component from configuration
    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        info!("Initializing route cache at: {}", config.storage.path);
        let store = Arc::new(RouteCacheStore::open(config.storage.clone())?);
        let routes = Arc::new(RouteResolver::with_default_chain(store, &config.distance)?);
        let rooms = Arc::new(RoomRegistry::new(config.registry.clone()));

        Ok(Self::new(rooms, routes))
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
    active_sessions: usize,
    cached_routes: usize,
}

#[derive(Debug, Serialize)]
struct InvalidateResponse {
    removed: usize,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.rooms.stats().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        active_sessions: stats.total_sessions,
        cached_routes: state.routes.store().len(),
    })
}

/// Server-to-server call from the mutation layer after a write commits
async fn notify_trip(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<String>,
    Json(request): Json<NotifyRequest>,
) -> Json<NotifyAck> {
    let ack = state.rooms.notify(&trip_id, request.kind).await;
    debug!(
        "Notify {:?} for trip {}: {} delivered",
        request.kind, trip_id, ack.delivered
    );
    Json(ack)
}

/// Resolve (or look up) the route estimate for a traveler/destination pair
async fn resolve_route(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RouteRequest>,
) -> Response {
    match state.routes.resolve(&request).await {
        Some(entry) => Json(entry).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Drop cached routes to a destination whose coordinates changed
async fn invalidate_destination(
    State(state): State<Arc<AppState>>,
    Path(destination_id): Path<String>,
) -> Result<Json<InvalidateResponse>, (StatusCode, String)> {
    let removed = state
        .routes
        .store()
        .invalidate_destination(&destination_id)
        .map_err(|e| {
            error!("Failed to invalidate destination {}: {}", destination_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    info!("Invalidated {} routes to {}", removed, destination_id);
    Ok(Json(InvalidateResponse { removed }))
}

/// Drop cached routes from a traveler whose home address changed
async fn invalidate_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<InvalidateResponse>, (StatusCode, String)> {
    let removed = state.routes.store().invalidate_user(&user_id).map_err(|e| {
        error!("Failed to invalidate user {}: {}", user_id, e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    info!("Invalidated {} routes from {}", removed, user_id);
    Ok(Json(InvalidateResponse { removed }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(trip_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for trip: {}", trip_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, trip_id, state))
}

/// Handle one live session from accept to close
async fn handle_websocket(socket: WebSocket, trip_id: String, state: Arc<AppState>) {
    let mut lifecycle = SessionState::Connecting;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let SessionHandle {
        session_id,
        mut outbound,
        sender: tx,
        ..
    } = match state.rooms.connect(&trip_id).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to register session for trip {}: {}", trip_id, e);
            return;
        }
    };

    lifecycle = lifecycle.advance();
    debug!("Session {} is {:?}", session_id, lifecycle);

    let session_id_send = session_id.clone();
    let session_id_recv = session_id.clone();

    // Task to forward queued messages to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            match SyncProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for session {}", session_id_send);
    });

    // Task to handle incoming WebSocket messages
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                Message::Text(text) => SyncProtocol::decode_client_text(&text),
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", session_id_recv);
                    break;
                }
                // Transport-level pings are answered by axum
                _ => continue,
            };

            match decoded {
                Ok(ClientMessage::Ping { timestamp }) => {
                    let _ = tx.send(ServerMessage::Pong {
                        timestamp,
                        server_time: chrono::Utc::now().timestamp(),
                    });
                }
                Ok(ClientMessage::Goodbye { reason }) => {
                    info!(
                        "Session {} saying goodbye: {:?}",
                        session_id_recv,
                        reason.unwrap_or_default()
                    );
                    break;
                }
                Err(e) => warn!("Failed to decode message: {}", e),
            }
        }
        debug!("Receive task ended for session {}", session_id_recv);
    });

    // Whichever side finishes first ends the session; stop the other one too
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.rooms.disconnect(&trip_id, &session_id);
    lifecycle = lifecycle.advance();
    info!(
        "Session {} disconnected from trip {} ({:?})",
        session_id, trip_id, lifecycle
    );
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws/:trip_id", get(ws_handler))
        .route("/api/trips/:trip_id/notify", post(notify_trip))
        .route("/api/routes/resolve", post(resolve_route))
        .route(
            "/api/routes/destinations/:destination_id",
            delete(invalidate_destination),
        )
        .route("/api/routes/users/:user_id", delete(invalidate_user))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
