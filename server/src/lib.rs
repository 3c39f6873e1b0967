//! packsync server - live trip broadcaster and route cache resolver.
//!
//! - One broadcaster actor per trip fans out "something changed" notifications
//! - Route estimates are resolved through a tiered provider chain and cached in Sled
//! - Axum serves WebSocket sessions and the server-to-server HTTP API

pub mod broadcast;
pub mod config;
pub mod http;
pub mod notify;
pub mod routes;
pub mod storage;

pub use broadcast::{NotifyAck, RoomRegistry};
pub use config::ServerConfig;
pub use http::{router, AppState};
pub use routes::{RouteRequest, RouteResolver};
