//! Room broadcaster for live trip sessions.
//!
//! This module provides:
//! - One room actor per trip, addressed by a stable name derived from the trip id
//! - Session registration and idempotent removal
//! - Best-effort fan-out of change notifications to every open session
//!
//! Each room is a tokio task that owns its session map. Connect, disconnect and
//! notify calls are messages on the room's channel, so the actor handles them
//! one at a time in arrival order and the map needs no lock.

mod registry;
mod room;

pub use registry::{RegistryConfig, RegistryStats, RoomRegistry};
pub use room::{RoomHandle, SessionHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to a room
#[derive(Debug, Clone, Error)]
pub enum RoomError {
    /// The room actor has stopped (it was reaped while the call was in flight)
    #[error("Room closed: {0}")]
    Closed(String),
}

/// Result type for room operations
pub type RoomResult<T> = Result<T, RoomError>;

/// Stable room name for a trip; every device talking about the trip lands here
pub fn room_name(trip_id: &str) -> String {
    format!("trip:{}", trip_id)
}

/// Acknowledgement returned once a notification fan-out has been attempted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyAck {
    /// Sessions the notification was handed to
    pub delivered: usize,
    /// Sessions whose send failed (dead but not yet reaped)
    pub failed: usize,
}

/// Lifecycle of a single live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Next state in the lifecycle; `Closed` stays `Closed`
    pub fn advance(self) -> Self {
        match self {
            SessionState::Connecting => SessionState::Open,
            SessionState::Open | SessionState::Closed => SessionState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}
