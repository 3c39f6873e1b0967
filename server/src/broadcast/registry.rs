//! Registry that maps trip ids to their room actors.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use packsync_shared::ChangeKind;

use super::room::{RoomHandle, SessionHandle};
use super::{room_name, NotifyAck, RoomError, RoomResult};

/// Configuration for the room registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often empty rooms are stopped and forgotten
    pub reap_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// All live rooms, at most one actor per room name
pub struct RoomRegistry {
    config: RegistryConfig,
    rooms: DashMap<String, RoomHandle>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Get the running room for a trip, starting one if needed
    fn room(&self, trip_id: &str) -> RoomHandle {
        let mut entry = self
            .rooms
            .entry(room_name(trip_id))
            .or_insert_with(|| RoomHandle::spawn(trip_id));

        if entry.is_closed() {
            *entry = RoomHandle::spawn(trip_id);
        }
        entry.clone()
    }

    /// Register a new live session in the trip's room
    pub async fn connect(&self, trip_id: &str) -> RoomResult<SessionHandle> {
        // A room reaped between lookup and send is replaced on the second try
        let mut last_err = None;
        for _ in 0..2 {
            match self.room(trip_id).connect().await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    debug!("Retrying connect after {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RoomError::Closed(room_name(trip_id))))
    }

    /// Remove a session; a no-op when the session or room is already gone
    pub fn disconnect(&self, trip_id: &str, session_id: &str) {
        if let Some(room) = self.rooms.get(&room_name(trip_id)) {
            room.disconnect(session_id);
        }
    }

    /// Fan a change notification out to every session connected for the trip
    pub async fn notify(&self, trip_id: &str, kind: ChangeKind) -> NotifyAck {
        // Nobody connected means nobody to tell; don't start a room for it
        let room = match self.rooms.get(&room_name(trip_id)) {
            Some(room) => room.clone(),
            None => return NotifyAck::default(),
        };

        match room.notify(kind).await {
            Ok(ack) => ack,
            Err(e) => {
                debug!("Notify on stopped room: {}", e);
                NotifyAck::default()
            }
        }
    }

    /// Number of sessions currently open for a trip
    pub async fn session_count(&self, trip_id: &str) -> usize {
        let room = match self.rooms.get(&room_name(trip_id)) {
            Some(room) => room.clone(),
            None => return 0,
        };
        room.session_count().await.unwrap_or(0)
    }

    /// Stop and forget rooms without sessions; returns how many were removed
    pub async fn reap_idle_rooms(&self) -> usize {
        let rooms: Vec<RoomHandle> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut reaped = 0;

        for room in rooms {
            let stopped = match room.stop_if_idle().await {
                Ok(stopped) => stopped,
                Err(RoomError::Closed(_)) => true,
            };
            if stopped {
                // Only drop the entry if it still points at the stopped actor
                if self
                    .rooms
                    .remove_if(room.name(), |_, current| current.same_actor(&room))
                    .is_some()
                {
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            info!("Reaped {} idle rooms", reaped);
        }
        reaped
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<RoomHandle> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut total_sessions = 0;
        for room in &rooms {
            total_sessions += room.session_count().await.unwrap_or(0);
        }

        RegistryStats {
            active_rooms: rooms.len(),
            total_sessions,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Start the idle room reaper
    pub fn start_background_tasks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let reap_interval = registry.config.reap_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            let mut shutdown = registry.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.reap_idle_rooms().await;
                    }
                    _ = shutdown.recv() => {
                        warn!("Room reaper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub total_sessions: usize,
    pub uptime_seconds: u64,
}
