//! Shared types for the packsync workspace.
//!
//! This crate holds everything both ends of a live connection must agree on:
//! - Pure domain records mirrored on every device
//! - Collection (table) names used by the local store and the sync queue
//! - The binary live-session protocol spoken between devices and room broadcasters
//! - Route lookup requests and cached route rows

pub mod model;
pub mod protocol;
pub mod route;

pub use model::{
    Category, Collection, Coordinates, Destination, EquipmentItem, MainCategory, PackingEntry,
    Record, Tag, Traveler, Trip, Vehicle,
};
pub use protocol::{ChangeKind, ClientMessage, ServerMessage, SyncProtocol, PROTOCOL_VERSION};
pub use route::{RouteCacheEntry, RouteRequest};

/// Identifier of a trip; also the key that selects a room broadcaster
pub type TripId = String;

/// Identifier of one live session inside a room
pub type SessionId = String;
